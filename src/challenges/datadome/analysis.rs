//! Extraction of DataDome challenge parameters from a blocked page.
//!
//! Two embedding styles exist: a JSON body whose `url` field points at the
//! geo captcha page, and an HTML page with an inline `var dd={...}` object
//! written with single quotes.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use url::Url;

use super::DatadomeError;

/// Type tag meaning the visitor is not asked to solve anything.
const NO_CHALLENGE_TAG: &str = "bv";

static INLINE_DD_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"var dd=([^"]+)</script>"#)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid datadome inline regex")
});

/// Parameters of one DataDome captcha challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeParams {
    /// Initial correlation id (`cid` / `initialCid`).
    pub cid: String,
    pub hash: String,
    /// Challenge type tag.
    pub t: String,
    pub s: String,
}

impl ChallengeParams {
    /// URL of the captcha page for these parameters.
    pub fn challenge_url(&self, host: &str, datadome_cid: &str, site_url: &str) -> String {
        format!(
            "{}/captcha/?initialCid={}&hash={}&cid={}&t={}&referrer={}&s={}",
            host.trim_end_matches('/'),
            self.cid,
            self.hash,
            datadome_cid,
            self.t,
            site_url,
            self.s
        )
    }

    /// URL submitting the solved captcha, spaces percent-encoded.
    pub fn check_url(
        &self,
        host: &str,
        datadome_cid: &str,
        token: &str,
        user_agent: &str,
        site_url: &str,
        parent_url: &str,
    ) -> String {
        format!(
            "{}/captcha/check?cid={}&icid={}&ccid=null&g-recaptcha-response={}&hash={}&ua={}&referer={}&parent_url={}&x-forwarded-for=&s={}",
            host.trim_end_matches('/'),
            datadome_cid,
            self.cid,
            token,
            self.hash,
            user_agent,
            site_url,
            parent_url,
            self.s
        )
        .replace(' ', "%20")
    }
}

/// Locate and decode the challenge parameters embedded in `body`.
///
/// Fails with [`DatadomeError::NoChallenge`] when neither embedding is
/// present or the type tag says no challenge is required.
pub fn parse_challenge(body: &str) -> Result<ChallengeParams, DatadomeError> {
    let params = if body.contains("url\":\"") {
        parse_json_embedding(body)?
    } else if body.contains("var dd") {
        parse_inline_embedding(body)?
    } else {
        return Err(DatadomeError::NoChallenge);
    };

    if params.t == NO_CHALLENGE_TAG {
        log::debug!("datadome: type tag {NO_CHALLENGE_TAG}, no challenge to solve");
        return Err(DatadomeError::NoChallenge);
    }
    Ok(params)
}

fn parse_json_embedding(body: &str) -> Result<ChallengeParams, DatadomeError> {
    let document: Value = serde_json::from_str(body)?;
    let raw = document
        .get("url")
        .and_then(Value::as_str)
        .ok_or(DatadomeError::MissingField("url"))?;
    let url = Url::parse(raw).map_err(|err| DatadomeError::InvalidUrl(err.to_string()))?;

    let query = url.query().unwrap_or_default();

    // Values are forwarded into the next URL as-is, so they stay encoded.
    let raw_value = |key: &'static str| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.to_string())
            .ok_or(DatadomeError::MissingField(key))
    };

    Ok(ChallengeParams {
        cid: raw_value("initialCid")?,
        hash: raw_value("hash")?,
        t: raw_value("t")?,
        s: raw_value("s")?,
    })
}

fn parse_inline_embedding(body: &str) -> Result<ChallengeParams, DatadomeError> {
    let raw = INLINE_DD_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .ok_or(DatadomeError::NoChallenge)?
        .as_str()
        .replace('\'', "\"");
    let object: Value = serde_json::from_str(raw.trim().trim_end_matches(';'))?;

    let text = |key: &'static str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(DatadomeError::MissingField(key))
    };
    let s = match object.get("s") {
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(value)) => value.clone(),
        _ => return Err(DatadomeError::MissingField("s")),
    };

    Ok(ChallengeParams {
        cid: text("cid")?,
        hash: text("hsh")?,
        t: text("t")?,
        s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INLINE_PAGE: &str = "<html><head><script>var dd={'cid':'AHrlqAAAAAMA1','hsh':'A55FBF4311ED6F1BF9911EB71931D5','t':'fe','s':17434,'host':'geo.captcha-delivery.com'}</script></head></html>";

    const JSON_BODY: &str = r#"{"url":"https://geo.captcha-delivery.com/captcha/?initialCid=AHrlqAAAAAMA2&hash=A55FBF4311ED6F1BF9911EB71931D5&t=fe&s=17434"}"#;

    #[test]
    fn parses_inline_object() {
        let params = parse_challenge(INLINE_PAGE).unwrap();
        assert_eq!(
            params,
            ChallengeParams {
                cid: "AHrlqAAAAAMA1".into(),
                hash: "A55FBF4311ED6F1BF9911EB71931D5".into(),
                t: "fe".into(),
                s: "17434".into(),
            }
        );
    }

    #[test]
    fn parses_json_url_field() {
        let params = parse_challenge(JSON_BODY).unwrap();
        assert_eq!(params.cid, "AHrlqAAAAAMA2");
        assert_eq!(params.t, "fe");
        assert_eq!(params.s, "17434");
    }

    #[test]
    fn json_values_keep_their_encoding() {
        let body = r#"{"url":"https://geo.captcha-delivery.com/captcha/?initialCid=AHrl%2Bq9%2Fz%3D%3D&hash=A55F&t=fe&s=17434"}"#;
        let params = parse_challenge(body).unwrap();
        assert_eq!(params.cid, "AHrl%2Bq9%2Fz%3D%3D");

        let challenge = params.challenge_url("https://geo.captcha-delivery.com", "dd", "https://shop.example/");
        let reparsed = Url::parse(&challenge).unwrap();
        let cid = reparsed
            .query_pairs()
            .find(|(name, _)| name == "initialCid")
            .map(|(_, value)| value.into_owned());
        assert_eq!(cid.as_deref(), Some("AHrl+q9/z=="));
    }

    #[test]
    fn bypass_tag_means_no_challenge() {
        let body = INLINE_PAGE.replace("'t':'fe'", "'t':'bv'");
        assert!(matches!(parse_challenge(&body), Err(DatadomeError::NoChallenge)));
    }

    #[test]
    fn unrelated_page_means_no_challenge() {
        assert!(matches!(
            parse_challenge("<html>welcome</html>"),
            Err(DatadomeError::NoChallenge)
        ));
    }

    #[test]
    fn missing_field_is_reported() {
        let body = r#"{"url":"https://geo.captcha-delivery.com/captcha/?initialCid=x&t=fe&s=1"}"#;
        assert!(matches!(
            parse_challenge(body),
            Err(DatadomeError::MissingField("hash"))
        ));
    }

    #[test]
    fn builds_urls() {
        let params = parse_challenge(INLINE_PAGE).unwrap();
        assert_eq!(
            params.challenge_url("https://geo.captcha-delivery.com", "dd-cookie", "https://shop.example/"),
            "https://geo.captcha-delivery.com/captcha/?initialCid=AHrlqAAAAAMA1&hash=A55FBF4311ED6F1BF9911EB71931D5&cid=dd-cookie&t=fe&referrer=https://shop.example/&s=17434"
        );
        let check = params.check_url(
            "https://geo.captcha-delivery.com/",
            "dd-cookie",
            "03AGd",
            "Mozilla/5.0 (X11)",
            "https://shop.example/",
            "https://shop.example/item",
        );
        assert_eq!(
            check,
            "https://geo.captcha-delivery.com/captcha/check?cid=dd-cookie&icid=AHrlqAAAAAMA1&ccid=null&g-recaptcha-response=03AGd&hash=A55FBF4311ED6F1BF9911EB71931D5&ua=Mozilla/5.0%20(X11)&referer=https://shop.example/&parent_url=https://shop.example/item&x-forwarded-for=&s=17434"
        );
    }
}
