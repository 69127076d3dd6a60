use chrono::Utc;
use rand::Rng;

/// Longest accepted file name, in bytes
pub const MAX_FILENAME_BYTES: usize = 240;

/// Longest accepted stash key, in characters
pub const MAX_FILE_KEY_LENGTH: usize = 255;

const ILLEGAL_FILENAME_CHARS: &[char] = &[':', '/', '\\', '#', '<', '>', '[', ']', '|', '{', '}'];

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Normalizes a client supplied file name into the form it would be published under.
///
/// Characters that cannot appear in a published name become `-`, runs of
/// whitespace become a single `_`.
pub fn filter_filename(name: &str) -> String {
    let mut filtered = String::with_capacity(name.len());
    let mut in_whitespace = false;

    for c in name.trim().chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                filtered.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;
        if c.is_control() || ILLEGAL_FILENAME_CHARS.contains(&c) {
            filtered.push('-');
        } else {
            filtered.push(c);
        }
    }

    filtered
}

/// A filtered name that still cannot be published.
pub fn is_illegal_filename(filtered: &str) -> bool {
    filtered.is_empty() || filtered == "." || filtered == ".." || filtered.contains("~~~")
}

/// Splits `name` into the part before the first dot and the chain of extensions after it.
pub fn split_extensions(name: &str) -> (String, Vec<String>) {
    let mut parts = name.split('.');
    let partname = parts.next().unwrap_or_default().to_string();
    let extensions = parts.map(|p| p.to_string()).collect();
    (partname, extensions)
}

/// The final extension, lowercased. `None` when missing or empty.
pub fn final_extension(name: &str) -> Option<String> {
    let (_, extensions) = split_extensions(name);
    extensions
        .last()
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_lowercase())
}

/// Mints a fresh stash key ending in the extension of `original_name`.
pub fn generate_file_key(original_name: &str) -> String {
    let mut rng = rand::thread_rng();
    let random: String = (0..12)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();

    let extension: String = final_extension(original_name)
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let extension = if extension.is_empty() {
        "bin".to_string()
    } else {
        extension
    };

    format!(
        "{}.{}.{}",
        to_base36(Utc::now().timestamp_micros().unsigned_abs()),
        random,
        extension
    )
}

/// Accepts keys shaped like `word[-.word]*.ext`.
pub fn is_valid_file_key(key: &str) -> bool {
    if key.is_empty() || key.len() > MAX_FILE_KEY_LENGTH {
        return false;
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return false;
    }
    match key.rsplit_once('.') {
        Some((head, ext)) => {
            !head.is_empty()
                && !ext.is_empty()
                && ext.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Checks if file content appears to be executable
pub fn is_executable_content(header: &[u8]) -> bool {
    if header.len() < 4 {
        return false;
    }

    // ELF binary (Linux)
    if header.starts_with(&[0x7F, 0x45, 0x4C, 0x46]) {
        return true;
    }

    // PE/COFF (Windows .exe, .dll)
    if header.starts_with(&[0x4D, 0x5A]) {
        return true;
    }

    // Mach-O (macOS)
    if header.starts_with(&[0xFE, 0xED, 0xFA, 0xCE])
        || header.starts_with(&[0xFE, 0xED, 0xFA, 0xCF])
        || header.starts_with(&[0xCE, 0xFA, 0xED, 0xFE])
        || header.starts_with(&[0xCF, 0xFA, 0xED, 0xFE])
    {
        return true;
    }

    // Shebang (shell scripts)
    header.starts_with(b"#!")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_filename() {
        assert_eq!(filter_filename("Sunset.png"), "Sunset.png");
        assert_eq!(filter_filename("  my  holiday photo.jpg "), "my_holiday_photo.jpg");
        assert_eq!(filter_filename("a/b\\c:d.png"), "a-b-c-d.png");
        assert_eq!(filter_filename("x[1]{2}|3#.gif"), "x-1--2--3-.gif");
        assert_eq!(filter_filename("tab\there.png"), "tab_here.png");
    }

    #[test]
    fn test_illegal_filenames() {
        assert!(is_illegal_filename(""));
        assert!(is_illegal_filename(".."));
        assert!(is_illegal_filename("sig~~~.png"));
        assert!(!is_illegal_filename("fine.png"));
    }

    #[test]
    fn test_split_extensions() {
        let (part, exts) = split_extensions("archive.tar.gz");
        assert_eq!(part, "archive");
        assert_eq!(exts, vec!["tar", "gz"]);

        let (part, exts) = split_extensions("noext");
        assert_eq!(part, "noext");
        assert!(exts.is_empty());

        let (part, exts) = split_extensions(".png");
        assert_eq!(part, "");
        assert_eq!(exts, vec!["png"]);
    }

    #[test]
    fn test_final_extension() {
        assert_eq!(final_extension("Photo.JPG").as_deref(), Some("jpg"));
        assert_eq!(final_extension("trailing."), None);
        assert_eq!(final_extension("none"), None);
    }

    #[test]
    fn test_generated_keys_are_valid_and_unique() {
        let a = generate_file_key("Sunset.PNG");
        let b = generate_file_key("Sunset.PNG");
        assert_ne!(a, b);
        assert!(a.ends_with(".png"));
        assert!(is_valid_file_key(&a));

        let c = generate_file_key("weird name");
        assert!(c.ends_with(".bin"));
        assert!(is_valid_file_key(&c));
    }

    #[test]
    fn test_file_key_format() {
        assert!(is_valid_file_key("1ab2c.3de4f.png"));
        assert!(is_valid_file_key("abc_def-1.jpg"));
        assert!(!is_valid_file_key("noextension"));
        assert!(!is_valid_file_key("../../etc/passwd"));
        assert!(!is_valid_file_key("bad key.png"));
        assert!(!is_valid_file_key(".png"));
        assert!(!is_valid_file_key("name."));
        assert!(!is_valid_file_key(&format!("{}.png", "a".repeat(300))));
    }

    #[test]
    fn test_is_executable_content() {
        // ELF header
        assert!(is_executable_content(&[0x7F, 0x45, 0x4C, 0x46, 0x00]));
        // PE header
        assert!(is_executable_content(&[0x4D, 0x5A, 0x00, 0x00]));
        // Shebang
        assert!(is_executable_content(b"#!/bin/bash"));
        // Regular content
        assert!(!is_executable_content(b"Hello World"));
        assert!(!is_executable_content(&[0x89, 0x50, 0x4E, 0x47])); // PNG
    }
}
