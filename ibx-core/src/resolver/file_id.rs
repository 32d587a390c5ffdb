use sha1::{Digest, Sha1};

/// Platform addressing: `hex(sha1(domain + "-" + relative_path))`.
pub fn resolve_file_id(domain: &str, relative_path: &str) -> String {
    let mut h = Sha1::new();
    h.update(domain.as_bytes());
    h.update(b"-");
    h.update(relative_path.as_bytes());
    hex::encode(h.finalize())
}
