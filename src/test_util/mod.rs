pub mod transport;

use crate::peer_addr::PeerAddr;

/// convenience method for unit test code: create a [PeerAddr] based on a number, the same number
///  generating the same address and different numbers different addresses
pub fn test_peer_from_number(number: u8) -> PeerAddr {
    PeerAddr::new(format!("00:00:00:00:00:{:02X}", number))
}
