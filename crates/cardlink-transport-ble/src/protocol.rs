use std::time::Duration;

/// GATT profile of the secure-element peripheral. Protocol constants, not
/// configurable.
pub const CARD_SERVICE_UUID: &str = "13d63400-2c97-0004-0000-4c6564676572";
/// Characteristic the host writes outbound fragments to.
pub const CARD_WRITE_CHAR_UUID: &str = "13d63400-2c97-0004-0002-4c6564676572";
/// Characteristic the peripheral notifies inbound fragments on.
pub const CARD_NOTIFY_CHAR_UUID: &str = "13d63400-2c97-0004-0001-4c6564676572";

/// Transfer unit assumed until the capability handshake says otherwise.
pub const DEFAULT_MTU: usize = 20;

/// Tag byte of the capability exchange, valid only during the handshake.
pub const MTU_EXCHANGE_TAG: u8 = 0x08;
/// Outbound capability request: tag plus four reserved zero bytes.
pub const MTU_EXCHANGE_REQUEST: [u8; 5] = [MTU_EXCHANGE_TAG, 0x00, 0x00, 0x00, 0x00];
/// Minimum length of a capability response carrying the negotiated MTU.
pub const MTU_EXCHANGE_RESPONSE_LEN: usize = 6;

/// Bound on both the write-confirmation wait and the inbound-fragment wait.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_millis(2000);

/// PBKDF2 iteration count for pairing-password derivation on this transport.
/// Low on purpose: the bonded link is already authenticated.
pub const PAIRING_KEY_ITERATIONS: u32 = 10;

/// Extracts the negotiated transfer unit from a capability response.
/// Returns `None` for anything that is not a well-formed `0x08` reply.
pub fn parse_mtu_response(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < MTU_EXCHANGE_RESPONSE_LEN || bytes[0] != MTU_EXCHANGE_TAG {
        return None;
    }
    Some(usize::from(bytes[5]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_negotiated_mtu() {
        assert_eq!(
            parse_mtu_response(&[0x08, 0x00, 0x00, 0x00, 0x00, 0x2f]),
            Some(47)
        );
    }

    #[test]
    fn rejects_wrong_tag() {
        assert_eq!(parse_mtu_response(&[0x05, 0x00, 0x00, 0x00, 0x00, 0x2f]), None);
    }

    #[test]
    fn rejects_short_response() {
        assert_eq!(parse_mtu_response(&[0x08, 0x00, 0x00, 0x00, 0x00]), None);
        assert_eq!(parse_mtu_response(&[]), None);
    }
}
