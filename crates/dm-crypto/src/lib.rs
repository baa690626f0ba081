//! Attachment AES-GCM crypto and NIP-92 `imeta` parsing — the pieces of the decryption
//! pipeline (spec §4.5, §4.9, §4.10) that are pure cryptography/parsing rather than
//! orchestration. NIP-04/NIP-44 envelope encryption itself is delegated to the `Signer`
//! capability (spec §6) and lives in the `engine` crate's trait definitions, not here.

pub mod attachment;
pub mod imeta;

pub use attachment::{
    decrypt_attachment, encrypt_attachment, hex_to_base64_if_hex, is_known_unsupported,
    supported_algorithms, AttachmentCryptoError, EncryptedAttachment, KEY_LEN, NONCE_LEN,
};
pub use imeta::{build_imeta_tag, parse_imeta_tags, parse_legacy_flat_tags};
