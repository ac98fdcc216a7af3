//! Gateway identity string used for BLE advertising discovery (§6). BLE
//! advertising itself is out of scope; only the string format is named by
//! the external contract.

/// `MGate-1210(P)-XXXX` for the PoE variant, `MGate-1210-XXXX` otherwise.
/// `XXXX` is the last two bytes of the MAC address, uppercase hex.
pub fn gateway_identity(mac: [u8; 6], poe: bool) -> String {
    let suffix = format!("{:02X}{:02X}", mac[4], mac[5]);
    if poe {
        format!("MGate-1210(P)-{suffix}")
    } else {
        format!("MGate-1210-{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poe_variant_string() {
        let mac = [0x00, 0x11, 0x22, 0x33, 0xAB, 0xCD];
        assert_eq!(gateway_identity(mac, true), "MGate-1210(P)-ABCD");
    }

    #[test]
    fn non_poe_variant_string() {
        let mac = [0x00, 0x11, 0x22, 0x33, 0x00, 0x0F];
        assert_eq!(gateway_identity(mac, false), "MGate-1210-000F");
    }
}
