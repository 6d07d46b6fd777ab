use url::Url;

use crate::error::{AppError, Result};

pub const ROOM_PARAM: &str = "room";

/// Room carried by a launch argument: the `room` query parameter of an
/// http(s) link, or the argument itself when it is not a link.
pub fn room_from_launch_arg(arg: &str) -> Option<String> {
    let arg = arg.trim();
    if arg.is_empty() {
        return None;
    }
    match Url::parse(arg) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => room_from_url(&url),
        Ok(_) | Err(_) if arg.contains("://") => None,
        _ => Some(arg.to_string()),
    }
}

fn room_from_url(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == ROOM_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|room| !room.is_empty())
}

/// `location` with its `room` parameter set to `room`; other parameters are kept.
pub fn location_with_room(location: &str, room: &str) -> Result<String> {
    let mut url = Url::parse(location).map_err(|e| AppError::Other(anyhow::anyhow!("invalid share URL {}: {}", location, e)))?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != ROOM_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
        pairs.append_pair(ROOM_PARAM, room);
    }
    Ok(url.to_string())
}

pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let mut clipboard =
        arboard::Clipboard::new().map_err(|e| AppError::Other(anyhow::anyhow!("clipboard unavailable: {}", e)))?;
    clipboard
        .set_text(text.to_owned())
        .map_err(|e| AppError::Other(anyhow::anyhow!("clipboard write failed: {}", e)))
}
