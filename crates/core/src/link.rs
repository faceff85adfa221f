use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Added to a bare channel id to get its dialog id (`-100` followed by the digits).
pub const PRIVATE_CHANNEL_ID_OFFSET: i64 = 1_000_000_000_000;

const RESERVED_PATHS: &[&str] = &["c", "s", "joinchat", "addlist", "addstickers", "share"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChatIdentifier {
    /// Dialog id of a channel or supergroup, e.g. `-1001234567890`.
    Channel(i64),
    /// Public username without the leading `@`.
    Username(String),
}

impl fmt::Display for ChatIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Channel(id) => write!(f, "{id}"),
            Self::Username(name) => write!(f, "@{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaReference {
    pub chat: ChatIdentifier,
    pub message_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("not a telegram message link: {url}")]
    Malformed { url: String },

    #[error("channel id out of range: {digits}")]
    ChannelId { digits: String },

    #[error("message id out of range: {digits}")]
    MessageId { digits: String },
}

fn private_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:https?://)?(?:www\.)?(?:t|telegram)\.me/c/(\d+)/(\d+)(?:[/?#].*)?$")
            .expect("private link pattern is valid")
    })
}

fn public_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:https?://)?(?:www\.)?(?:t|telegram)\.me/([A-Za-z][A-Za-z0-9_]{2,31})/(\d+)(?:[/?#].*)?$",
        )
        .expect("public link pattern is valid")
    })
}

/// Parses a `t.me` message link into the chat and message it points at.
///
/// Private links (`t.me/c/<channel>/<message>`) carry the bare channel id, which is
/// turned into the `-100…` dialog id. Public links (`t.me/<username>/<message>`) yield a
/// username reference. Anything after the message id (extra path segments, `?single`,
/// fragments) is ignored.
pub fn resolve(url: &str) -> Result<MediaReference, ParseError> {
    let url = url.trim();

    if let Some(caps) = private_link().captures(url) {
        let channel = &caps[1];
        let message = &caps[2];
        let bare: i64 = channel.parse().map_err(|_| ParseError::ChannelId {
            digits: channel.to_string(),
        })?;
        let dialog_id = bare
            .checked_add(PRIVATE_CHANNEL_ID_OFFSET)
            .map(|v| -v)
            .ok_or_else(|| ParseError::ChannelId {
                digits: channel.to_string(),
            })?;
        return Ok(MediaReference {
            chat: ChatIdentifier::Channel(dialog_id),
            message_id: parse_message_id(message)?,
        });
    }

    if let Some(caps) = public_link().captures(url) {
        let username = &caps[1];
        if RESERVED_PATHS
            .iter()
            .any(|p| p.eq_ignore_ascii_case(username))
        {
            return Err(ParseError::Malformed {
                url: url.to_string(),
            });
        }
        return Ok(MediaReference {
            chat: ChatIdentifier::Username(username.to_string()),
            message_id: parse_message_id(&caps[2])?,
        });
    }

    Err(ParseError::Malformed {
        url: url.to_string(),
    })
}

fn parse_message_id(digits: &str) -> Result<i32, ParseError> {
    match digits.parse::<i32>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ParseError::MessageId {
            digits: digits.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_link_maps_to_dialog_id() {
        let r = resolve("https://t.me/c/1345678901/42").unwrap();
        assert_eq!(r.chat, ChatIdentifier::Channel(-1001345678901));
        assert_eq!(r.message_id, 42);
        assert_eq!(r.chat.to_string(), "-1001345678901");
    }

    #[test]
    fn private_link_tolerates_scheme_and_trailing_segments() {
        for url in [
            "http://t.me/c/777/9",
            "t.me/c/777/9",
            "https://t.me/c/777/9/",
            "https://t.me/c/777/9?single",
            "https://telegram.me/c/777/9",
        ] {
            let r = resolve(url).unwrap_or_else(|e| panic!("{url}: {e}"));
            assert_eq!(r.chat, ChatIdentifier::Channel(-1000000000777), "{url}");
            assert_eq!(r.message_id, 9, "{url}");
        }
    }

    #[test]
    fn segments_after_message_id_are_ignored() {
        let r = resolve("https://t.me/c/555/10/20").unwrap();
        assert_eq!(r.chat, ChatIdentifier::Channel(-1000000000555));
        assert_eq!(r.message_id, 10);
    }

    #[test]
    fn public_link_yields_username() {
        let r = resolve("https://t.me/durov_channel/1234").unwrap();
        assert_eq!(r.chat, ChatIdentifier::Username("durov_channel".to_string()));
        assert_eq!(r.chat.to_string(), "@durov_channel");
        assert_eq!(r.message_id, 1234);
    }

    #[test]
    fn rejects_non_links() {
        for url in [
            "",
            "https://example.com/c/1/2",
            "https://t.me/c/abc/2",
            "https://t.me/c/123",
            "https://t.me/durov",
            "https://t.me/1abc/5",
            "https://t.me/joinchat/5",
        ] {
            assert!(
                matches!(resolve(url), Err(ParseError::Malformed { .. })),
                "{url}"
            );
        }
    }

    #[test]
    fn rejects_ids_wider_than_their_type() {
        assert!(matches!(
            resolve("https://t.me/c/99999999999999999999/1"),
            Err(ParseError::ChannelId { .. })
        ));
        assert!(matches!(
            resolve("https://t.me/c/9223372036854775807/1"),
            Err(ParseError::ChannelId { .. })
        ));
        assert!(matches!(
            resolve("https://t.me/c/123/4294967296"),
            Err(ParseError::MessageId { .. })
        ));
        assert!(matches!(
            resolve("https://t.me/somechannel/0"),
            Err(ParseError::MessageId { .. })
        ));
    }
}
