use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}
