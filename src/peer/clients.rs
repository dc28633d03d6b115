//! Peer-id to client-name mapping
//!
//! Most clients use the Azureus convention: `-XX1234-` where `XX` names the
//! client and the digits encode a version. Only the handful of clients seen
//! in the wild with any frequency get friendly names; everything else is
//! shown raw.

/// 20-byte peer id from the handshake.
pub type PeerId = [u8; 20];

/// Human-readable client name for a handshake peer id.
pub fn client_for_id(peer_id: &PeerId) -> String {
    if peer_id[0] == b'-' && peer_id[7] == b'-' {
        let code = &peer_id[1..3];
        let version = azureus_version(&peer_id[3..7]);
        let name = match code {
            b"AZ" => "Azureus",
            b"DE" => "Deluge",
            b"LT" => "libtorrent",
            b"lt" => "libTorrent",
            b"qB" => "qBittorrent",
            b"TR" => "Transmission",
            b"UT" => "\u{00b5}Torrent",
            b"UW" => "Undertow",
            _ => {
                return format!(
                    "{}{} {}",
                    char::from(code[0]),
                    char::from(code[1]),
                    version
                );
            }
        };
        return format!("{name} {version}");
    }

    // Shadow-style and unknown ids: show printable prefix
    let printable: String = peer_id
        .iter()
        .take(8)
        .map(|&byte| {
            if byte.is_ascii_graphic() {
                char::from(byte)
            } else {
                '?'
            }
        })
        .collect();
    printable
}

fn azureus_version(digits: &[u8]) -> String {
    let digit = |byte: u8| {
        if byte.is_ascii_digit() {
            (byte - b'0') as u32
        } else if byte.is_ascii_alphabetic() {
            (byte.to_ascii_lowercase() - b'a') as u32 + 10
        } else {
            0
        }
    };
    format!(
        "{}.{}.{}",
        digit(digits[0]),
        digit(digits[1]),
        digit(digits[2])
    )
}
