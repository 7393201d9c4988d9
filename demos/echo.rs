//! TCP echo server demo, renamed out of `examples/` (that directory is
//! reserved for the read-only retrieval pack). Echoes in buffers up to 100
//! bytes, terminating the connection on a zero-byte read, matching §8
//! scenario 5's server contract.

use std::net::{Ipv4Addr, SocketAddrV4};

use rt_coro::service::{Config, Service};
use rt_coro::tcp::TcpListener;

const DEFAULT_LISTEN_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(127, 0, 0, 1), 5555);

fn main() {
    env_logger::init();

    let svc = Service::new(Config::default()).expect("create service");
    svc.add_coro(|| {
        let addr = SocketAddrV4::new(DEFAULT_LISTEN_ADDR.0, DEFAULT_LISTEN_ADDR.1);
        let listener = TcpListener::bind(addr).expect("bind listener");
        println!(
            "Starting tcp echo server on {:?}",
            listener.local_addr().expect("local_addr")
        );

        loop {
            let (conn, _peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    eprintln!("accept failed: {}", e);
                    break;
                }
            };

            rt_coro::go(move || {
                let mut buf = [0u8; 100];
                loop {
                    let n = match conn.read(&mut buf) {
                        Ok(n) => n,
                        Err(e) => {
                            eprintln!("read failed: {}", e);
                            break;
                        }
                    };
                    if n == 0 {
                        // EOF: terminate the connection.
                        break;
                    }
                    let mut written = 0;
                    while written < n {
                        match conn.write(&buf[written..n]) {
                            Ok(w) => written += w,
                            Err(e) => {
                                eprintln!("write failed: {}", e);
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    svc.run().expect("service run");
}
