use mime_guess::mime::Mime;
use uuid::Uuid;

const FALLBACK_TYPE: &str = "application/octet-stream";

/// Fresh random 128-bit identifier, 32 lowercase hex chars
pub fn new_identifier() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Primary media type of an upload, parameters stripped.
///
/// The filename extension wins; the type declared by the client is only
/// consulted when the extension is unknown.
pub fn detect_media_type(file_name: &str, declared: Option<&str>) -> String {
    if let Some(guess) = mime_guess::from_path(file_name).first() {
        return guess.essence_str().to_ascii_lowercase();
    }

    declared
        .and_then(|d| d.parse::<Mime>().ok())
        .map(|m| m.essence_str().to_ascii_lowercase())
        .unwrap_or_else(|| FALLBACK_TYPE.to_string())
}

/// Client filename reduced to something safe to store and echo back
pub fn sanitize_file_name(file_name: &str) -> Option<String> {
    let name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if name.is_empty() || name == "." || name == ".." || name.chars().any(char::is_control) {
        return None;
    }
    Some(name.to_string())
}
