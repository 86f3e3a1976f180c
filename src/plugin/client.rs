//! Host side of the plugin RPC channel.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde_json::Value;

use super::handshake::{HandshakeLine, Transport};
use super::protocol::{JsonRpcRequest, JsonRpcResponse, PluginInfo, METHOD_GET_INFO, METHOD_RUN};
use super::{RpcError, RpcResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The capability every loaded plugin exposes to the host.
///
/// The registry only ever holds `Box<dyn Plugin>`, so the transport is an
/// implementation detail of the adapter.
pub trait Plugin: Send {
    /// Ask the plugin to describe itself.
    fn info(&mut self) -> RpcResult<PluginInfo>;

    /// Execute the plugin's command with the arguments it was spawned with.
    fn run(&mut self) -> RpcResult<()>;
}

enum Conn {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Conn {
    fn connect(line: &HandshakeLine) -> io::Result<Self> {
        match line.transport {
            Transport::Tcp => {
                let addr = line.address.to_socket_addrs()?.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
                })?;
                let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            }
            #[cfg(unix)]
            Transport::Unix => {
                Ok(Self::Unix(std::os::unix::net::UnixStream::connect(&line.address)?))
            }
            #[cfg(not(unix))]
            Transport::Unix => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }

    fn try_clone(&self) -> io::Result<Self> {
        match self {
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
            #[cfg(unix)]
            Self::Unix(s) => s.try_clone().map(Self::Unix),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            Self::Unix(s) => s.set_read_timeout(timeout),
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
        }
    }
}

/// JSON-RPC client connected to one plugin's server.
pub struct RpcClient {
    address: String,
    writer: Conn,
    reader: BufReader<Conn>,
    next_id: i64,
    timeout: Option<Duration>,
}

impl RpcClient {
    /// Connect to the server announced in `line`.
    ///
    /// `timeout` bounds each call; `None` waits indefinitely.
    pub fn connect(line: &HandshakeLine, timeout: Option<Duration>) -> RpcResult<Self> {
        let connect_err =
            |source| RpcError::Connect { address: line.address.clone(), source };

        let writer = Conn::connect(line).map_err(connect_err)?;
        let reader = writer.try_clone().map_err(connect_err)?;
        reader.set_read_timeout(timeout).map_err(connect_err)?;

        Ok(Self {
            address: line.address.clone(),
            writer,
            reader: BufReader::new(reader),
            next_id: 1,
            timeout,
        })
    }

    /// Address of the plugin's server.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a request and wait for its response.
    fn call(&mut self, method: &str) -> RpcResult<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let request = JsonRpcRequest::new(id, method, None);
        let request_json = serde_json::to_string(&request)?;
        tracing::trace!(address = %self.address, "-> {}", request_json);

        writeln!(self.writer, "{}", request_json)?;
        self.writer.flush()?;

        let mut line = String::new();
        let read = self.reader.read_line(&mut line).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                RpcError::Timeout(self.timeout.unwrap_or_default())
            }
            _ => RpcError::Io(e),
        })?;
        if read == 0 {
            return Err(RpcError::Disconnected);
        }
        tracing::trace!(address = %self.address, "<- {}", line.trim());

        let response: JsonRpcResponse = serde_json::from_str(&line)?;
        if response.id != Some(id.into()) {
            return Err(RpcError::Malformed(format!(
                "response id {:?} does not match request id {}",
                response.id, id
            )));
        }

        match response.into_result::<Value>() {
            Ok(value) => Ok(value?),
            Err(status) => Err(RpcError::Status(status)),
        }
    }
}

impl Plugin for RpcClient {
    fn info(&mut self) -> RpcResult<PluginInfo> {
        let value = self.call(METHOD_GET_INFO)?;
        let info: PluginInfo = serde_json::from_value(value)?;
        if info.name.trim().is_empty() {
            return Err(RpcError::Malformed("plugin reported an empty name".to_string()));
        }
        Ok(info)
    }

    fn run(&mut self) -> RpcResult<()> {
        self.call(METHOD_RUN)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::protocol::JsonRpcError;
    use std::net::TcpListener;
    use std::thread;

    /// Serve canned response lines to the first connection.
    fn serve(responses: Vec<&'static str>) -> HandshakeLine {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            for response in responses {
                let mut request = String::new();
                if reader.read_line(&mut request).unwrap() == 0 {
                    return;
                }
                writeln!(writer, "{}", response).unwrap();
            }
        });

        HandshakeLine::new(1, Transport::Tcp, address)
    }

    #[test]
    fn test_get_info() {
        let line = serve(vec![
            r#"{"jsonrpc":"2.0","id":1,"result":{"name":"foo","description":"Foo things","version":"1.0"}}"#,
        ]);
        let mut client = RpcClient::connect(&line, None).unwrap();
        assert_eq!(client.address(), line.address);

        let info = client.info().unwrap();
        assert_eq!(
            info,
            PluginInfo {
                name: "foo".to_string(),
                description: "Foo things".to_string(),
                version: "1.0".to_string()
            }
        );
    }

    #[test]
    fn test_run_status_error() {
        let line = serve(vec![
            r#"{"jsonrpc":"2.0","id":1,"result":null}"#,
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":2,"message":"bucket not found"}}"#,
        ]);
        let mut client = RpcClient::connect(&line, None).unwrap();

        client.run().unwrap();
        let err = client.run().unwrap_err();
        match err {
            RpcError::Status(status) => assert_eq!(status, JsonRpcError::new(2, "bucket not found")),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_is_transport_error() {
        let line = serve(vec![]);
        let mut client = RpcClient::connect(&line, None).unwrap();

        let err = client.run().unwrap_err();
        assert!(!err.is_status());
    }

    #[test]
    fn test_malformed_response() {
        let line = serve(vec!["this is not json"]);
        let mut client = RpcClient::connect(&line, None).unwrap();

        assert!(matches!(client.info(), Err(RpcError::Malformed(_))));
    }

    #[test]
    fn test_run_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let hold = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(stream);
        });

        let line = HandshakeLine::new(1, Transport::Tcp, address);
        let mut client = RpcClient::connect(&line, Some(Duration::from_millis(100))).unwrap();
        assert!(matches!(client.run(), Err(RpcError::Timeout(_))));
        hold.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let line = HandshakeLine::new(1, Transport::Tcp, address);
        assert!(matches!(RpcClient::connect(&line, None), Err(RpcError::Connect { .. })));
    }
}
