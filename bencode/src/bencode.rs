use std::collections::BTreeMap;
use thiserror::Error;

/// Decoding refuses structures nested deeper than this. KRPC messages are
/// three levels deep; anything past the cap is hostile or corrupt input.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Bencode {
    Int(i64),
    /// Byte strings, not UTF-8 strings. Ids, tokens and compact node blobs
    /// are raw binary.
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    /// Keys are byte strings; BTreeMap keeps them in the lexicographic order
    /// canonical encoding requires.
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unsupported type prefix {0:#04x}")]
    UnsupportedType(u8),
    #[error("invalid integer literal")]
    InvalidInteger,
    #[error("invalid string length prefix")]
    InvalidLength,
    #[error("dictionary key is not a byte string")]
    InvalidDictKey,
    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

impl Bencode {
    /// Decodes the first bencoded value in `data`. Trailing bytes are
    /// tolerated; several DHT implementations pad datagrams past the
    /// top-level dictionary.
    pub fn decode(data: &[u8]) -> Result<Bencode, BencodeError> {
        let (value, _consumed) = Bencode::decode_prefix(data)?;
        Ok(value)
    }

    /// Decodes the first value and reports how many bytes it occupied.
    pub fn decode_prefix(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut decoder = Decoder { data, pos: 0 };
        let value = decoder.parse_value(0)?;
        Ok((value, decoder.pos))
    }

    /// Serializes to canonical bencode (dictionary keys sorted).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(bytes) => encode_bytes(bytes, out),
            Bencode::List(list) => {
                out.push(b'l');
                for item in list {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(dict) => {
                out.push(b'd');
                for (key, value) in dict {
                    encode_bytes(key, out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Bencode> {
        match self {
            Bencode::Dict(dict) => dict.get(key),
            _ => None,
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEnd)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BencodeError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(BencodeError::UnexpectedEnd)?;
        if end > self.data.len() {
            return Err(BencodeError::UnexpectedEnd);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Consumes bytes up to (not including) the next `stop` byte.
    fn take_until(&mut self, stop: u8) -> Result<&'a [u8], BencodeError> {
        let rel = self.data[self.pos..]
            .iter()
            .position(|&b| b == stop)
            .ok_or(BencodeError::UnexpectedEnd)?;
        let slice = &self.data[self.pos..self.pos + rel];
        self.pos += rel + 1;
        Ok(slice)
    }

    fn parse_value(&mut self, depth: usize) -> Result<Bencode, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => {
                self.bump();
                self.parse_int()
            }
            b'0'..=b'9' => self.parse_bytes().map(|b| Bencode::Bytes(b.to_vec())),
            b'l' => {
                self.bump();
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.parse_value(depth + 1)?);
                }
                self.bump();
                Ok(Bencode::List(items))
            }
            b'd' => {
                self.bump();
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    if !self.peek()?.is_ascii_digit() {
                        return Err(BencodeError::InvalidDictKey);
                    }
                    let key = self.parse_bytes()?.to_vec();
                    let value = self.parse_value(depth + 1)?;
                    dict.insert(key, value);
                }
                self.bump();
                Ok(Bencode::Dict(dict))
            }
            other => Err(BencodeError::UnsupportedType(other)),
        }
    }

    fn parse_int(&mut self) -> Result<Bencode, BencodeError> {
        let digits = self.take_until(b'e')?;
        let value = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::InvalidInteger)?;
        Ok(Bencode::Int(value))
    }

    fn parse_bytes(&mut self) -> Result<&'a [u8], BencodeError> {
        let digits = self.take_until(b':')?;
        let len = std::str::from_utf8(digits)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::InvalidLength)?;
        self.take(len)
    }
}

/// Conversion into a bencode value, used by [`BencodeBuilder`] so message
/// fields insert without manual wrapping.
pub trait Encode {
    fn to_bencode(&self) -> Bencode;
}

impl Encode for Bencode {
    fn to_bencode(&self) -> Bencode {
        self.clone()
    }
}

impl Encode for String {
    fn to_bencode(&self) -> Bencode {
        Bencode::Bytes(self.as_bytes().to_vec())
    }
}

impl Encode for &str {
    fn to_bencode(&self) -> Bencode {
        Bencode::Bytes(self.as_bytes().to_vec())
    }
}

impl Encode for i64 {
    fn to_bencode(&self) -> Bencode {
        Bencode::Int(*self)
    }
}

impl Encode for &[u8] {
    fn to_bencode(&self) -> Bencode {
        Bencode::Bytes(self.to_vec())
    }
}

impl Encode for bytes::Bytes {
    fn to_bencode(&self) -> Bencode {
        Bencode::Bytes(self.to_vec())
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn to_bencode(&self) -> Bencode {
        Bencode::List(self.iter().map(Encode::to_bencode).collect())
    }
}

/// Dictionary construction with optional fields skipped when absent.
pub trait BencodeBuilder {
    fn new() -> Self;
    fn insert_field<T: Encode>(&mut self, key: &str, value: &T) -> &mut Self;
    fn insert_optional<T: Encode>(&mut self, key: &str, value: &Option<T>) -> &mut Self;
    fn build(self) -> Bencode;
}

impl BencodeBuilder for BTreeMap<Vec<u8>, Bencode> {
    fn new() -> Self {
        BTreeMap::new()
    }

    fn insert_field<T: Encode>(&mut self, key: &str, value: &T) -> &mut Self {
        self.insert(key.as_bytes().to_vec(), value.to_bencode());
        self
    }

    fn insert_optional<T: Encode>(&mut self, key: &str, value: &Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.insert(key.as_bytes().to_vec(), value.to_bencode());
        }
        self
    }

    fn build(self) -> Bencode {
        Bencode::Dict(self)
    }
}

/// Typed field access on a decoded dictionary. Absent keys and wrong-typed
/// values both read as `None`; callers decide which fields are required.
pub trait BencodeDict {
    fn get_bytes(&self, key: &[u8]) -> Option<&[u8]>;
    fn get_str(&self, key: &[u8]) -> Option<&str>;
    fn get_i64(&self, key: &[u8]) -> Option<i64>;
    fn get_list(&self, key: &[u8]) -> Option<&[Bencode]>;
    fn get_dict(&self, key: &[u8]) -> Option<&BTreeMap<Vec<u8>, Bencode>>;
}

impl BencodeDict for BTreeMap<Vec<u8>, Bencode> {
    fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        match self.get(key) {
            Some(Bencode::Bytes(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    fn get_str(&self, key: &[u8]) -> Option<&str> {
        self.get_bytes(key)
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    fn get_i64(&self, key: &[u8]) -> Option<i64> {
        match self.get(key) {
            Some(Bencode::Int(i)) => Some(*i),
            _ => None,
        }
    }

    fn get_list(&self, key: &[u8]) -> Option<&[Bencode]> {
        match self.get(key) {
            Some(Bencode::List(l)) => Some(l.as_slice()),
            _ => None,
        }
    }

    fn get_dict(&self, key: &[u8]) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self.get(key) {
            Some(Bencode::Dict(d)) => Some(d),
            _ => None,
        }
    }
}
