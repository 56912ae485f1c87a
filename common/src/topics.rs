pub const TOPIC_DEVICE_ANNOUNCE: &str = "hsc/device/announce";
pub const TOPIC_DEVICE_STATUS_PREFIX: &str = "hsc/device/status/";

pub const STATUS_ONLINE: &str = "online";

pub fn device_status_topic(board_id: u32) -> String {
    format!("{TOPIC_DEVICE_STATUS_PREFIX}{board_id}")
}

/// `esp32-XXYYZZ` from the NIC-specific half of the MAC.
pub fn hostname_from_mac(mac: [u8; 6]) -> String {
    format!("esp32-{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5])
}

/// Retained announcement body: `<name>,<hostname>,<ip>`.
pub fn announcement_payload(device_name: &str, hostname: &str, address: &str) -> String {
    format!("{device_name},{hostname},{address}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_topic_is_keyed_by_board() {
        assert_eq!(device_status_topic(7), "hsc/device/status/7");
    }

    #[test]
    fn hostname_uses_last_three_octets() {
        let mac = [0x24, 0x6f, 0x28, 0xab, 0x0c, 0x9e];
        assert_eq!(hostname_from_mac(mac), "esp32-AB0C9E");
    }

    #[test]
    fn announcement_is_comma_separated() {
        assert_eq!(
            announcement_payload("HSC-Device-7", "esp32-AB0C9E", "192.168.1.40"),
            "HSC-Device-7,esp32-AB0C9E,192.168.1.40"
        );
    }
}
