use socket2::{Domain, Socket, Type};
use std::net::{AddrParseError, SocketAddr};

const BACKLOG: i32 = 128;

pub fn listen_reuse_socket(addr: &SocketAddr) -> Result<Socket, std::io::Error> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&(*addr).into())?;
    socket.listen(BACKLOG)?;
    Ok(socket)
}

/// Parse a listen address, accepting the `:port` shorthand for all interfaces.
pub fn parse_address(mut addr: String) -> Result<SocketAddr, AddrParseError> {
    if addr.starts_with(':') {
        addr.insert_str(0, "0.0.0.0");
    }

    addr.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_shorthand() {
        let addr = parse_address(":9090".to_string()).unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:9090");
    }

    #[test]
    fn parse_full_address() {
        let addr = parse_address("127.0.0.1:8080".to_string()).unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.is_ipv4());
    }

    #[test]
    fn parse_invalid_address() {
        assert!(parse_address("localhost".to_string()).is_err());
    }
}
