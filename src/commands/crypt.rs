use std::error::Error;
use std::path::{Path, PathBuf};

use log::debug;

use crate::bytes::write_artifact;
use crate::commands::copy_to_clipboard;
use crate::cryptography::{decode_key, decrypt_file, encode_key, encrypt_file, generate_key};

const ENCRYPTED_PREFIX: &str = "encrypted_";
const DECRYPTED_PREFIX: &str = "decrypted_";

/// Encrypt a file next to itself as `encrypted_<name>`. Without a key a
/// fresh one is generated and printed.
pub async fn encrypt(file_path: &str, key: Option<String>) -> Result<PathBuf, Box<dyn Error>> {
    let path = Path::new(file_path);
    let key = match key {
        Some(text) => decode_key(&text)?,
        None => {
            let key = generate_key();
            println!("Generated key: \x1b[4m\x1b[1m{}\x1b[0m", encode_key(&key));
            key
        }
    };

    let plaintext = tokio::fs::read(path).await?;
    let blob = encrypt_file(&key, &plaintext);
    debug!("Encrypted {} bytes into {} bytes", plaintext.len(), blob.len());

    let output = write_artifact(parent_dir(path), ENCRYPTED_PREFIX, &file_name(path), &blob).await?;
    println!("Encrypted file saved: {}", output.display());
    Ok(output)
}

/// Decrypt a file as `decrypted_<name>`, dropping a leading `encrypted_`
/// from the name. Nothing is written when decryption fails.
pub async fn decrypt(file_path: &str, key: &str) -> Result<PathBuf, Box<dyn Error>> {
    let path = Path::new(file_path);
    let key = decode_key(key)?;

    let blob = tokio::fs::read(path).await?;
    let plaintext = decrypt_file(&key, &blob)?;

    let name = file_name(path);
    let name = name.strip_prefix(ENCRYPTED_PREFIX).unwrap_or(&name);
    let output = write_artifact(parent_dir(path), DECRYPTED_PREFIX, name, &plaintext).await?;
    println!("Decrypted file saved: {}", output.display());
    Ok(output)
}

/// Print a fresh key and put it on the clipboard when there is one.
pub fn keygen() -> String {
    let text = encode_key(&generate_key());
    if copy_to_clipboard(&text) {
        println!("Key (copied to clipboard): \x1b[4m\x1b[1m{}\x1b[0m", text);
    } else {
        println!("Key: \x1b[4m\x1b[1m{}\x1b[0m", text);
    }
    text
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
