//! Pretty-prints a bencoded KRPC datagram.
//!
//! Usage:
//!   cargo run --example inspect -- <file>
//!   cargo run --example inspect -- --hex d1:ad2:id20:...

use bencode::Bencode;
use std::env;
use std::fs;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().skip(1).collect();
    let data = match args.as_slice() {
        [flag, raw] if flag == "--hex" => hex::decode(raw)?,
        [path] => fs::read(path)?,
        _ => {
            eprintln!("usage: inspect <file> | inspect --hex <bytes>");
            std::process::exit(2);
        }
    };

    let (value, consumed) = Bencode::decode_prefix(&data)?;
    print_value(&value, 0);
    if consumed < data.len() {
        println!("({} trailing bytes)", data.len() - consumed);
    }
    Ok(())
}

fn print_value(value: &Bencode, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        Bencode::Int(i) => println!("{pad}{i}"),
        Bencode::Bytes(b) => println!("{pad}{}", render_bytes(b)),
        Bencode::List(items) => {
            println!("{pad}[");
            for item in items {
                print_value(item, indent + 1);
            }
            println!("{pad}]");
        }
        Bencode::Dict(dict) => {
            println!("{pad}{{");
            for (key, val) in dict {
                let key = String::from_utf8_lossy(key);
                match val {
                    // compact node records: 20-byte id + 4-byte ip + 2-byte port
                    Bencode::Bytes(b) if key == "nodes" && b.len() % 26 == 0 => {
                        println!("{pad}  {key}:");
                        for rec in b.chunks_exact(26) {
                            let port = u16::from_be_bytes([rec[24], rec[25]]);
                            println!(
                                "{pad}    {} {}.{}.{}.{}:{}",
                                hex::encode(&rec[..20]),
                                rec[20],
                                rec[21],
                                rec[22],
                                rec[23],
                                port
                            );
                        }
                    }
                    Bencode::List(_) | Bencode::Dict(_) => {
                        println!("{pad}  {key}:");
                        print_value(val, indent + 2);
                    }
                    _ => {
                        print!("{pad}  {key}: ");
                        print_value(val, 0);
                    }
                }
            }
            println!("{pad}}}");
        }
    }
}

fn render_bytes(b: &[u8]) -> String {
    if b.len() == 20 {
        // ids and info-hashes
        return format!("<{}>", hex::encode(b));
    }
    if b.len() == 6 {
        // compact peer address
        let port = u16::from_be_bytes([b[4], b[5]]);
        return format!("{}.{}.{}.{}:{}", b[0], b[1], b[2], b[3], port);
    }
    match std::str::from_utf8(b) {
        Ok(s) if s.chars().all(|c| c.is_ascii_graphic() || c == ' ') => format!("{s:?}"),
        _ => format!("<{} bytes: {}>", b.len(), hex::encode(b)),
    }
}
