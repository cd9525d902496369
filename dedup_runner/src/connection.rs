// dedup_runner/src/connection.rs
use std::io::{self, BufRead, BufReader};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Returned by the record callback to keep reading or end the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFlow {
    Continue,
    Close,
}

/// One admitted client socket read as newline-delimited text.
#[derive(Debug)]
pub struct LineConnection {
    id: u64,
    peer: Option<SocketAddr>,
    stream: TcpStream,
    state: AtomicU8,
    reading: AtomicBool,
}

impl LineConnection {
    pub fn new(id: u64, stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            id,
            peer,
            stream,
            state: AtomicU8::new(OPEN),
            reading: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            OPEN => ConnectionState::Open,
            CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Reads records until end-of-stream, an I/O error, or `on_record`
    /// returning [`LineFlow::Close`]. Runs at most once per connection; later
    /// calls return immediately.
    ///
    /// `on_error` only fires for failures on an open socket. A read that fails
    /// because `stop` already shut the socket down is not reported.
    pub fn run<R, E>(&self, mut on_record: R, mut on_error: E)
    where
        R: FnMut(&str) -> LineFlow,
        E: FnMut(&io::Error),
    {
        if self.reading.swap(true, Ordering::AcqRel) {
            return;
        }
        let reader = match self.stream.try_clone() {
            Ok(reader) => reader,
            Err(e) => {
                on_error(&e);
                return;
            }
        };
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        while self.state() == ConnectionState::Open {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    debug!("connection {} reached end of stream", self.id);
                    break;
                }
                Ok(_) => {
                    if on_record(strip_line_ending(&line)) == LineFlow::Close {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if self.state() == ConnectionState::Open {
                        on_error(&e);
                    }
                    break;
                }
            }
        }
    }

    /// Shuts the socket down once. Returns `false` if it was already closing.
    pub fn stop(&self) -> bool {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // The peer or a concurrent reader may have torn the socket down already.
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state.store(CLOSED, Ordering::Release);
        debug!("connection {} closed", self.id);
        true
    }
}

fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn strips_lf_and_crlf() {
        assert_eq!(strip_line_ending("123\n"), "123");
        assert_eq!(strip_line_ending("123\r\n"), "123");
        assert_eq!(strip_line_ending("123"), "123");
        assert_eq!(strip_line_ending("\n"), "");
    }

    #[test]
    fn delivers_records_in_order_until_eof() {
        let (mut client, server) = socket_pair();
        let conn = LineConnection::new(7, server);
        client.write_all(b"000000001\r\n000000002\nlast").unwrap();
        drop(client);

        let mut records = Vec::new();
        let mut errors = 0;
        conn.run(
            |line| {
                records.push(line.to_string());
                LineFlow::Continue
            },
            |_| errors += 1,
        );
        assert_eq!(records, vec!["000000001", "000000002", "last"]);
        assert_eq!(errors, 0);
        assert_eq!(conn.id(), 7);
    }

    #[test]
    fn close_flow_stops_reading() {
        let (mut client, server) = socket_pair();
        let conn = LineConnection::new(1, server);
        client.write_all(b"first\nsecond\n").unwrap();

        let mut seen = Vec::new();
        conn.run(
            |line| {
                seen.push(line.to_string());
                LineFlow::Close
            },
            |_| {},
        );
        assert_eq!(seen, vec!["first"]);
    }

    #[test]
    fn run_is_idempotent() {
        let (client, server) = socket_pair();
        let conn = LineConnection::new(1, server);
        drop(client);
        conn.run(|_| LineFlow::Continue, |_| {});

        let called = std::cell::Cell::new(false);
        conn.run(
            |_| {
                called.set(true);
                LineFlow::Continue
            },
            |_| called.set(true),
        );
        assert!(!called.get());
    }

    #[test]
    fn stop_unblocks_reader_and_is_idempotent() {
        let (client, server) = socket_pair();
        let conn = std::sync::Arc::new(LineConnection::new(2, server));

        let reader = {
            let conn = conn.clone();
            thread::spawn(move || {
                let mut errors = 0;
                conn.run(|_| LineFlow::Continue, |_| errors += 1);
                errors
            })
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(conn.stop());
        assert!(!conn.stop());
        assert_eq!(reader.join().unwrap(), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
        drop(client);
    }
}
