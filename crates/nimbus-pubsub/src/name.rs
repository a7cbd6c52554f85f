//! Backend-legal resource names derived from arbitrary strings.

use sha2::{Digest, Sha256};

/// Length of every [`sanitize`] result.
pub const SANITIZED_LEN: usize = 25;

/// Prefix shared by every pub/sub topic and queue name.
pub const PUBSUB_PREFIX: &str = "ps";

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Hash the concatenation of `parts` into a fixed-length lowercase `[0-9a-z]` name.
///
/// The first 128 bits of the SHA-256 digest are written in base 36, zero padded
/// to [`SANITIZED_LEN`] characters (`36^25 > 2^128`).
pub fn sanitize(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();

    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    let mut value = u128::from_be_bytes(head);

    let mut out = [b'0'; SANITIZED_LEN];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value % 36) as usize];
        value /= 36;
    }
    out.iter().map(|&b| b as char).collect()
}

/// Topic name of `channel`; also the name prefix of all its node queues.
pub fn channel_name(channel: &str) -> String {
    format!("{PUBSUB_PREFIX}{}", sanitize(&[channel]))
}

/// Queue name of `node` on `channel`.
pub fn queue_name(channel: &str, node: &str) -> String {
    format!("{}{}", channel_name(channel), sanitize(&[node]))
}

/// `<computer>-<user>` for the current process.
pub fn default_node_name() -> String {
    let computer = env_non_empty("HOSTNAME")
        .or_else(|| env_non_empty("COMPUTERNAME"))
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string());
    let user = env_non_empty("USER")
        .or_else(|| env_non_empty("USERNAME"))
        .unwrap_or_else(|| "user".to_string());
    format!("{computer}-{user}")
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}
