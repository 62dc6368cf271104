use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use utcp::{Endpoint, Stack, TcpStream};

fn main() {
    env_logger::init();

    let stack = Arc::new(
        Stack::new(
            "tun1",
            Ipv4Addr::from_str("10.10.10.11").unwrap(),
            Ipv4Addr::from_str("255.255.255.0").unwrap(),
        )
        .unwrap(),
    );

    println!(">>> Trying to connect to server...");
    let local = Endpoint::new(Ipv4Addr::from_str("10.10.10.11").unwrap(), 34343);
    let foreign = Endpoint::new(Ipv4Addr::from_str("10.10.10.10").unwrap(), 9090);
    let mut stream = TcpStream::connect(stack, local, foreign).unwrap();
    println!(">>> Connected!");

    loop {
        let mut buf = [0u8; 1500];
        let n = stream.read(&mut buf[..]).unwrap();

        if n == 0 {
            break;
        }

        stream.write_all(&buf[..n]).unwrap();

        println!(
            "\n>>> Read: {:?}\n",
            String::from_iter(buf[..n].iter().map(|c| *c as char))
        );
    }
}
