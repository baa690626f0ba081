//! NIP-92 `imeta` tag parsing and the legacy flat-tag fallback (spec §4.5).
//!
//! Modeled on `patrickulrich-nostr.blue`'s `components::photo_card::parse_imeta_tags`:
//! each tag is reduced to its raw string vector, then each `"key value"` field after the
//! first element is split on the first space.

use dm_types::{AttachmentAlgorithm, FileEncryption, FileMetadata};
use nostr::{Tag, TagKind};

use crate::attachment::hex_to_base64_if_hex;

/// Build one `imeta` tag from a `FileMetadata` descriptor (spec §4.9 "Attachment
/// encryption" — inverse of `parse_imeta_tags`).
pub fn build_imeta_tag(meta: &FileMetadata) -> Tag {
    let mut fields: Vec<String> = Vec::new();
    if let Some(url) = &meta.url {
        fields.push(format!("url {url}"));
    }
    if let Some(mime) = &meta.mime_type {
        fields.push(format!("m {mime}"));
    }
    if let Some(size) = meta.size {
        fields.push(format!("size {size}"));
    }
    if let Some(name) = &meta.name {
        fields.push(format!("alt {name}"));
    }
    if let Some(dim) = &meta.dim {
        fields.push(format!("dim {dim}"));
    }
    if let Some(blurhash) = &meta.blurhash {
        fields.push(format!("blurhash {blurhash}"));
    }
    if let Some(thumb) = &meta.thumb {
        fields.push(format!("thumb {thumb}"));
    }
    for fallback in &meta.fallback {
        fields.push(format!("fallback {fallback}"));
    }
    if let Some(hash) = &meta.hash {
        fields.push(format!("x {hash}"));
    }
    if let Some(enc) = &meta.encryption {
        fields.push(format!("encryption-algorithm {}", enc.algorithm.as_str()));
        fields.push(format!("decryption-key {}", enc.key_base64));
        fields.push(format!("decryption-nonce {}", enc.nonce_base64));
    }
    Tag::custom(TagKind::Custom("imeta".into()), fields)
}

/// Parse every `imeta` tag on an event into one `FileMetadata` per tag (spec §4.5a).
/// Tags without a `url` field are dropped — a gift-wrapped file message with a malformed
/// `imeta` tag still decrypts; it just doesn't surface that attachment.
pub fn parse_imeta_tags(tags: &[Tag]) -> Vec<FileMetadata> {
    tags.iter()
        .filter(|t| tag_name(t) == Some("imeta"))
        .filter_map(|t| parse_one_imeta(&t.clone().to_vec()))
        .collect()
}

/// Legacy single-attachment form: the same recognised keys as top-level tags directly on
/// the rumor, rather than bundled into one `imeta` tag (spec §4.5b).
pub fn parse_legacy_flat_tags(tags: &[Tag]) -> Option<FileMetadata> {
    let mut fields: Vec<String> = vec!["legacy".to_string()];
    for tag in tags {
        let v = tag.clone().to_vec();
        if v.len() < 2 {
            continue;
        }
        if RECOGNISED_KEYS.contains(&v[0].as_str()) {
            fields.push(format!("{} {}", v[0], v[1]));
        }
    }
    if fields.len() == 1 {
        return None;
    }
    parse_one_imeta(&fields)
}

const RECOGNISED_KEYS: &[&str] = &[
    "url",
    "m",
    "size",
    "alt",
    "dim",
    "blurhash",
    "thumb",
    "fallback",
    "x",
    "encryption-algorithm",
    "decryption-key",
    "decryption-nonce",
];

fn tag_name(tag: &Tag) -> Option<String> {
    tag.clone().to_vec().first().cloned()
}

fn parse_one_imeta(fields: &[String]) -> Option<FileMetadata> {
    let mut meta = FileMetadata::default();
    let mut algorithm: Option<String> = None;
    let mut key: Option<String> = None;
    let mut nonce: Option<String> = None;

    for field in fields.iter().skip(1) {
        let Some((k, v)) = field.split_once(' ') else {
            continue;
        };
        match k {
            "url" => meta.url = Some(v.to_string()),
            "m" => meta.mime_type = Some(v.to_string()),
            "size" => meta.size = v.parse().ok(),
            "alt" => meta.name = Some(v.to_string()),
            "dim" => meta.dim = Some(v.to_string()),
            "blurhash" => meta.blurhash = Some(v.to_string()),
            "thumb" => meta.thumb = Some(v.to_string()),
            "fallback" => meta.fallback.push(v.to_string()),
            "x" => meta.hash = Some(v.to_string()),
            "encryption-algorithm" => algorithm = Some(v.to_string()),
            "decryption-key" => key = Some(hex_to_base64_if_hex(v)),
            "decryption-nonce" => nonce = Some(hex_to_base64_if_hex(v)),
            _ => {}
        }
    }

    if let (Some(algorithm), Some(key_base64), Some(nonce_base64)) = (algorithm, key, nonce) {
        meta.encryption = Some(FileEncryption {
            algorithm: AttachmentAlgorithm::parse(&algorithm),
            key_base64,
            nonce_base64,
        });
    }

    if meta.has_url() {
        Some(meta)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::TagKind;

    fn imeta_tag(fields: &[&str]) -> Tag {
        Tag::custom(TagKind::Custom("imeta".into()), fields.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_one_file_per_imeta_tag() {
        let tags = vec![
            imeta_tag(&["url https://h/a", "m image/png", "dim 1920x1080"]),
            imeta_tag(&["url https://h/b", "m image/jpeg"]),
        ];
        let files = parse_imeta_tags(&tags);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].url.as_deref(), Some("https://h/a"));
        assert_eq!(files[0].dim.as_deref(), Some("1920x1080"));
        assert_eq!(files[1].mime_type.as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn drops_imeta_tags_without_url() {
        let tags = vec![imeta_tag(&["m image/png"])];
        assert!(parse_imeta_tags(&tags).is_empty());
    }

    #[test]
    fn multiple_fallback_entries_collect_into_a_list() {
        let tags = vec![imeta_tag(&[
            "url https://h/a",
            "fallback https://mirror1/a",
            "fallback https://mirror2/a",
        ])];
        let files = parse_imeta_tags(&tags);
        assert_eq!(files[0].fallback.len(), 2);
    }

    #[test]
    fn hex_decryption_key_is_normalized_to_base64() {
        let hex_key = hex::encode([9u8; 32]);
        let hex_nonce = hex::encode([1u8; 12]);
        let tags = vec![imeta_tag(&[
            "url https://h/a",
            "encryption-algorithm aes-gcm",
            &format!("decryption-key {hex_key}"),
            &format!("decryption-nonce {hex_nonce}"),
        ])];
        let files = parse_imeta_tags(&tags);
        let enc = files[0].encryption.as_ref().unwrap();
        assert_ne!(enc.key_base64, hex_key);
        assert_eq!(enc.algorithm, AttachmentAlgorithm::AesGcm);
    }

    #[test]
    fn build_imeta_tag_round_trips_through_parse() {
        let meta = FileMetadata {
            url: Some("https://h/a".to_string()),
            mime_type: Some("image/png".to_string()),
            size: Some(1234),
            name: Some("photo".to_string()),
            dim: Some("100x100".to_string()),
            blurhash: None,
            thumb: None,
            fallback: vec!["https://mirror/a".to_string()],
            hash: Some("deadbeef".to_string()),
            encryption: Some(FileEncryption {
                algorithm: AttachmentAlgorithm::AesGcm,
                key_base64: "a2V5".to_string(),
                nonce_base64: "bm9uY2U=".to_string(),
            }),
        };
        let tag = build_imeta_tag(&meta);
        let parsed = parse_imeta_tags(&[tag]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], meta);
    }

    #[test]
    fn legacy_flat_tags_produce_a_single_file() {
        let tags = vec![
            Tag::custom(TagKind::Custom("url".into()), vec!["https://h/a".to_string()]),
            Tag::custom(TagKind::Custom("m".into()), vec!["image/png".to_string()]),
        ];
        let meta = parse_legacy_flat_tags(&tags).unwrap();
        assert_eq!(meta.url.as_deref(), Some("https://h/a"));
        assert_eq!(meta.mime_type.as_deref(), Some("image/png"));
    }
}
