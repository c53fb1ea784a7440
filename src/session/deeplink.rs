use url::Url;

use crate::backend::OtpType;

/// Email-confirmation callback carried by a deep link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationLink {
    pub token_hash: String,
    pub kind: OtpType,
}

/// Pulls `token_hash` and `type` out of a callback URL.
///
/// Returns `None` for anything that is not a complete confirmation link; such
/// links are ignored, not reported.
pub fn parse_confirmation(link: &str) -> Option<ConfirmationLink> {
    let url = Url::parse(link).ok()?;
    let mut token_hash = None;
    let mut kind = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "token_hash" if token_hash.is_none() => token_hash = Some(value.into_owned()),
            "type" if kind.is_none() => kind = Some(value.into_owned()),
            _ => {}
        }
    }
    let token_hash = token_hash.filter(|t| !t.is_empty())?;
    let kind = kind?.parse().ok()?;
    Some(ConfirmationLink { token_hash, kind })
}

#[cfg(test)]
mod deeplink_tests {
    use super::*;

    #[test]
    fn parses_callback_with_both_parameters() {
        let link = parse_confirmation("nutrisignal://auth/callback?token_hash=abc%2F123&type=signup")
            .expect("complete link");
        assert_eq!(link.token_hash, "abc/123");
        assert_eq!(link.kind, OtpType::Signup);
    }

    #[test]
    fn parameter_order_and_fragments_do_not_matter() {
        let link =
            parse_confirmation("nutrisignal://auth/callback?type=email&x=1&token_hash=t1#frag")
                .expect("complete link");
        assert_eq!(link.token_hash, "t1");
        assert_eq!(link.kind, OtpType::Email);
    }

    #[test]
    fn incomplete_or_foreign_links_are_ignored() {
        assert_eq!(parse_confirmation("nutrisignal://auth/callback?type=signup"), None);
        assert_eq!(parse_confirmation("nutrisignal://auth/callback?token_hash=abc"), None);
        assert_eq!(parse_confirmation("nutrisignal://auth/callback?token_hash=&type=signup"), None);
        assert_eq!(parse_confirmation("nutrisignal://auth/callback?token_hash=a&type=sms"), None);
        assert_eq!(parse_confirmation("not a url"), None);
    }
}
