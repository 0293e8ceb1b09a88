//! Negotiable algorithm tables
//!
//! Maps the configuration's algorithm name lists onto the SSH layer's
//! preference tables. Configured names not in the supported set are warned
//! about and dropped; an empty configured list keeps the defaults. The
//! restricted tables are leaked once at startup because the handshake layer
//! wants `'static` preference slices and the configuration never changes
//! after initialization.

use russh::{cipher, kex, mac};
use tracing::warn;

/// Supported key-exchange algorithms, default preference order first.
pub const KEX_TABLE: &[(&str, kex::Name)] = &[
    ("curve25519-sha256", kex::CURVE25519),
    ("curve25519-sha256@libssh.org", kex::CURVE25519_PRE_RFC_8731),
    ("ecdh-sha2-nistp256", kex::ECDH_SHA2_NISTP256),
    ("ecdh-sha2-nistp384", kex::ECDH_SHA2_NISTP384),
    ("ecdh-sha2-nistp521", kex::ECDH_SHA2_NISTP521),
    ("diffie-hellman-group14-sha256", kex::DH_G14_SHA256),
    ("diffie-hellman-group16-sha512", kex::DH_G16_SHA512),
];

/// Supported ciphers, default preference order first.
pub const CIPHER_TABLE: &[(&str, cipher::Name)] = &[
    ("chacha20-poly1305@openssh.com", cipher::CHACHA20_POLY1305),
    ("aes256-gcm@openssh.com", cipher::AES_256_GCM),
    ("aes256-ctr", cipher::AES_256_CTR),
    ("aes192-ctr", cipher::AES_192_CTR),
    ("aes128-ctr", cipher::AES_128_CTR),
];

/// Supported MACs, default preference order first.
pub const MAC_TABLE: &[(&str, mac::Name)] = &[
    ("hmac-sha2-256-etm@openssh.com", mac::HMAC_SHA256_ETM),
    ("hmac-sha2-512-etm@openssh.com", mac::HMAC_SHA512_ETM),
    ("hmac-sha2-256", mac::HMAC_SHA256),
    ("hmac-sha2-512", mac::HMAC_SHA512),
    ("hmac-sha1", mac::HMAC_SHA1),
];

fn restrict<N: Copy>(
    kind: &str,
    table: &[(&str, N)],
    allowed: &[String],
) -> Vec<N> {
    if allowed.is_empty() {
        return table.iter().map(|(_, name)| *name).collect();
    }

    let mut selected = Vec::new();
    for entry in allowed {
        match table.iter().find(|(label, _)| label == entry) {
            Some((_, name)) => selected.push(*name),
            None => warn!("unsupported {} algorithm {:?} ignored", kind, entry),
        }
    }

    if selected.is_empty() {
        warn!(
            "no usable {} algorithms in configuration, falling back to defaults",
            kind
        );
        return table.iter().map(|(_, name)| *name).collect();
    }
    selected
}

/// Resolve the configured kex list to a `'static` preference slice.
pub fn kex_preferences(allowed: &[String]) -> &'static [kex::Name] {
    Box::leak(restrict("kex", KEX_TABLE, allowed).into_boxed_slice())
}

/// Resolve the configured cipher list to a `'static` preference slice.
pub fn cipher_preferences(allowed: &[String]) -> &'static [cipher::Name] {
    Box::leak(restrict("cipher", CIPHER_TABLE, allowed).into_boxed_slice())
}

/// Resolve the configured MAC list to a `'static` preference slice.
pub fn mac_preferences(allowed: &[String]) -> &'static [mac::Name] {
    Box::leak(restrict("mac", MAC_TABLE, allowed).into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_keeps_defaults() {
        let prefs = restrict("kex", KEX_TABLE, &[]);
        assert_eq!(prefs.len(), KEX_TABLE.len());
    }

    #[test]
    fn test_restriction_preserves_configured_order() {
        let allowed = vec![
            "ecdh-sha2-nistp384".to_string(),
            "curve25519-sha256".to_string(),
        ];
        let prefs = restrict("kex", KEX_TABLE, &allowed);
        assert_eq!(prefs.len(), 2);
        assert_eq!(prefs[0], kex::ECDH_SHA2_NISTP384);
        assert_eq!(prefs[1], kex::CURVE25519);
    }

    #[test]
    fn test_unknown_names_are_dropped() {
        let allowed = vec![
            "aes256-ctr".to_string(),
            "des-cbc".to_string(),
        ];
        let prefs = restrict("cipher", CIPHER_TABLE, &allowed);
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0], cipher::AES_256_CTR);
    }

    #[test]
    fn test_all_unknown_falls_back_to_defaults() {
        let allowed = vec!["hmac-md5".to_string()];
        let prefs = restrict("mac", MAC_TABLE, &allowed);
        assert_eq!(prefs.len(), MAC_TABLE.len());
    }
}
