//! k8n.cn transport: check-in submission and WeChat QR login.
//!
//! Every request impersonates the WeChat in-app browser on Android - the
//! platform serves a different (and bot-hostile) flow to desktop user agents.
//! Responses are HTML pages meant for humans, so classification works off
//! status classes and content markers rather than a JSON contract.

use crate::config::Task;
use crate::platform::{CheckinPlatform, LoginAttempt, LoginProvider, LoginResult, PlatformError};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, REFERER, USER_AGENT};
use reqwest::StatusCode;
use reqwest::Url;
use scraper::{Html, Selector};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// User-Agent of the WeChat in-app browser on an Android handset.
pub const MOBILE_UA: &str = "Mozilla/5.0 (Linux; Android 12; PAL-AL00 Build/HUAWEIPAL-AL00; wv) AppleWebKit/537.36 (KHTML, like Gecko) Version/4.0 Chrome/116.0.0.0 Mobile Safari/537.36 XWEB/1160065 MMWEBSDK/20231202 MMWEBID/1136 MicroMessenger/8.0.47.2560(0x28002F35) WeChat/arm64 Weixin NetType/4G Language/zh_CN ABI/arm64";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// The punch page embeds each open session id in one of these forms,
/// depending on the sign-in mode (plain card, password form, GPS button).
static PUNCH_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"punchcard_(\d+)").unwrap(),
        Regex::new(r"punch_pwd_frm_(\d+)").unwrap(),
        Regex::new(r"punch_gps\((\d+)\)").unwrap(),
    ]
});

static LOGIN_SCRIPT_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"']*login\.b8n\.cn[^\s"']*"#).unwrap());

/// HTTP implementation of [`CheckinPlatform`] against k8n.cn.
pub struct K8nPlatform {
    client: Client,
    base_url: String,
}

impl K8nPlatform {
    pub fn new(base_url: impl Into<String>) -> Result<Self, PlatformError> {
        let client = Client::builder()
            .user_agent(MOBILE_UA)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PlatformError::Transient(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn headers(&self, task: &Task) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(MOBILE_UA));

        let referer = format!("{}/student/course/{}", self.base_url, task.class_id);
        if let Ok(val) = HeaderValue::from_str(&referer) {
            headers.insert(REFERER, val);
        }

        // Some exported cookies carry a stray "username=" prefix.
        let cookie = task.cookie.replace("username=", "");
        if let Ok(val) = HeaderValue::from_str(&cookie) {
            headers.insert(COOKIE, val);
        }

        headers
    }
}

impl CheckinPlatform for K8nPlatform {
    fn active_checkins(&self, task: &Task) -> Result<Vec<String>, PlatformError> {
        let url = format!(
            "{}/student/course/{}/punchs",
            self.base_url, task.class_id
        );
        let resp = self
            .client
            .get(&url)
            .headers(self.headers(task))
            .send()
            .map_err(transport_error)?;

        check_status(resp.status())?;
        let text = resp.text().map_err(transport_error)?;
        check_session_markers(&text)?;

        Ok(parse_punch_ids(&text))
    }

    fn submit_checkin(
        &self,
        task: &Task,
        checkin_id: &str,
        lat: &str,
        lng: &str,
    ) -> Result<String, PlatformError> {
        let url = format!(
            "{}/student/punchs/course/{}/{}",
            self.base_url, task.class_id, checkin_id
        );
        let acc = format!("{:.1}", task.location.accuracy);
        let params = [
            ("id", checkin_id),
            ("lat", lat),
            ("lng", lng),
            ("acc", acc.as_str()),
            ("res", ""),
            ("gps_addr", ""),
            ("pwd", ""),
        ];

        let resp = self
            .client
            .post(&url)
            .headers(self.headers(task))
            .form(&params)
            .send()
            .map_err(transport_error)?;

        check_status(resp.status())?;
        let text = resp.text().map_err(transport_error)?;
        check_session_markers(&text)?;

        classify_submit_reply(&text)
    }
}

/// Network-level failures (refused, DNS, timeout) are always retryable.
fn transport_error(e: reqwest::Error) -> PlatformError {
    PlatformError::Transient(e.to_string())
}

fn check_status(status: StatusCode) -> Result<(), PlatformError> {
    if status.is_server_error() {
        return Err(PlatformError::Transient(format!("server error {status}")));
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(PlatformError::Rejected(format!(
            "session not accepted ({status})"
        )));
    }
    if !status.is_success() {
        return Err(PlatformError::Rejected(format!(
            "unexpected status {status}"
        )));
    }
    Ok(())
}

/// An expired cookie bounces to the login page instead of erroring.
fn check_session_markers(html: &str) -> Result<(), PlatformError> {
    if html.contains("uidlogin") || html.contains("请先登录") {
        return Err(PlatformError::Rejected(
            "session expired, scan the QR code to log in again".to_string(),
        ));
    }
    Ok(())
}

/// Pull open check-in session ids out of the punch page, skipping cards the
/// platform already marks as signed (已签).
fn parse_punch_ids(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let card_selector = Selector::parse("div.card-body").unwrap();

    let mut ids = Vec::new();
    for card in document.select(&card_selector) {
        let card_html = card.html();
        if card_html.contains("已签") {
            continue;
        }
        for re in PUNCH_ID_PATTERNS.iter() {
            for cap in re.captures_iter(&card_html) {
                let id = cap[1].to_string();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
    }
    ids
}

fn classify_submit_reply(html: &str) -> Result<String, PlatformError> {
    let document = Html::parse_document(html);
    let text: String = document.root_element().text().collect::<Vec<_>>().join("");
    let text = text.trim();

    if text.contains("成功") || text.contains("Success") {
        return Ok("签到成功".to_string());
    }

    let reason: String = text.chars().take(80).collect();
    Err(PlatformError::Rejected(reason))
}

/// QR login against login.b8n.cn.
pub struct K8nLoginProvider {
    qr_url: String,
    base_url: String,
}

impl K8nLoginProvider {
    pub fn new(qr_url: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            qr_url: qr_url.into(),
            base_url: base_url.into(),
        }
    }
}

impl LoginProvider for K8nLoginProvider {
    fn begin(&self) -> Result<Box<dyn LoginAttempt>, PlatformError> {
        // The jar outlives the challenge: the uidlogin redirect deposits the
        // session cookies we ultimately hand back to the caller.
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .user_agent(MOBILE_UA)
            .cookie_provider(jar.clone())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PlatformError::Transient(e.to_string()))?;

        let resp = client
            .get(&self.qr_url)
            .send()
            .map_err(transport_error)?;
        check_status(resp.status())?;
        let html = resp.text().map_err(transport_error)?;

        let login_url = extract_login_url(&html)?;

        Ok(Box::new(K8nLoginAttempt {
            client,
            jar,
            login_url,
            qr_url: self.qr_url.clone(),
            base_url: self.base_url.clone(),
        }))
    }
}

struct K8nLoginAttempt {
    client: Client,
    jar: Arc<Jar>,
    login_url: String,
    qr_url: String,
    base_url: String,
}

impl LoginAttempt for K8nLoginAttempt {
    fn login_url(&self) -> &str {
        &self.login_url
    }

    fn poll(&self) -> Result<Option<LoginResult>, PlatformError> {
        let url = format!("{}?op=checklogin", self.qr_url);
        let reply: Value = self
            .client
            .get(&url)
            .send()
            .map_err(transport_error)?
            .json()
            .map_err(|e| {
                PlatformError::Transient(format!("unexpected checklogin response: {e}"))
            })?;

        if reply.get("status").and_then(Value::as_i64) != Some(1) {
            return Ok(None);
        }

        let redirect = reply
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PlatformError::Rejected("login confirmed but no redirect url given".to_string())
            })?;

        // Follow the handoff so the platform session cookies land in our jar.
        let target = if redirect.starts_with("http") {
            redirect.to_string()
        } else {
            let query = redirect.split('?').nth(1).unwrap_or("");
            format!("{}/student/uidlogin?{}", self.base_url, query)
        };
        let resp = self.client.get(&target).send().map_err(transport_error)?;
        check_status(resp.status())?;

        let cookie = self.session_cookie()?;
        let class_id = self.first_class_id().unwrap_or_default();

        Ok(Some(LoginResult { cookie, class_id }))
    }
}

impl K8nLoginAttempt {
    /// Serialize the jar contents for the check-in host into a Cookie header
    /// value; this string is the durable credential stored on the task.
    fn session_cookie(&self) -> Result<String, PlatformError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| PlatformError::Rejected(format!("bad base url: {e}")))?;
        let header = self.jar.cookies(&url).ok_or_else(|| {
            PlatformError::Rejected("login completed but no session cookie was granted".to_string())
        })?;
        header
            .to_str()
            .map(|s| s.to_string())
            .map_err(|_| PlatformError::Rejected("session cookie is not valid UTF-8".to_string()))
    }

    /// Best effort: the student home page links the enrolled courses; the
    /// first one becomes the task's default class id.
    fn first_class_id(&self) -> Option<String> {
        static COURSE_LINK: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"student/course/(\d+)").unwrap());

        let url = format!("{}/student", self.base_url);
        let text = self.client.get(&url).send().ok()?.text().ok()?;
        COURSE_LINK
            .captures(&text)
            .map(|cap| cap[1].to_string())
    }
}

/// The QR page embeds the signed login URL (sess/tm/sign parameters) in an
/// inline script; that URL is exactly what the phone needs to open.
fn extract_login_url(html: &str) -> Result<String, PlatformError> {
    let document = Html::parse_document(html);
    let script_selector = Selector::parse("script").unwrap();

    for script in document.select(&script_selector) {
        let content = script.text().collect::<Vec<_>>().join("");
        if !content.contains("login.b8n.cn") {
            continue;
        }
        if let Some(m) = LOGIN_SCRIPT_URL.find(&content) {
            let url = m.as_str().to_string();
            if url.contains("sess=") {
                return Ok(url);
            }
        }
    }

    Err(PlatformError::Rejected(
        "could not extract the signed login url from the QR page".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_punch_ids_all_modes() {
        let html = r#"
            <div class="card-body">
                <div id="punchcard_101">open</div>
            </div>
            <div class="card-body">
                <form id="punch_pwd_frm_202"></form>
            </div>
            <div class="card-body">
                <button onclick="punch_gps(303)">sign</button>
            </div>
        "#;
        assert_eq!(parse_punch_ids(html), vec!["101", "202", "303"]);
    }

    #[test]
    fn test_parse_punch_ids_skips_signed_cards() {
        let html = r#"
            <div class="card-body">已签<div id="punchcard_101"></div></div>
            <div class="card-body"><div id="punchcard_102"></div></div>
        "#;
        assert_eq!(parse_punch_ids(html), vec!["102"]);
    }

    #[test]
    fn test_parse_punch_ids_dedupes() {
        let html = r#"
            <div class="card-body">
                <div id="punchcard_101"></div>
                <button onclick="punch_gps(101)">sign</button>
            </div>
        "#;
        assert_eq!(parse_punch_ids(html), vec!["101"]);
    }

    #[test]
    fn test_classify_submit_reply_success() {
        let html = "<html><body><p>签到成功</p></body></html>";
        assert_eq!(classify_submit_reply(html).unwrap(), "签到成功");
    }

    #[test]
    fn test_classify_submit_reply_denial() {
        let html = "<html><body>不在签到范围内</body></html>";
        match classify_submit_reply(html) {
            Err(PlatformError::Rejected(reason)) => assert!(reason.contains("不在签到范围内")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_expired_session_detected() {
        let html = "<html><body><a href=\"/student/uidlogin?x=1\">请先登录</a></body></html>";
        assert!(matches!(
            check_session_markers(html),
            Err(PlatformError::Rejected(_))
        ));
    }

    #[test]
    fn test_extract_login_url() {
        let html = r#"
            <html><head><script>
                var u = "https://login.b8n.cn/weixin/login/student/2?sess=abc123&tm=1718000000&sign=deadbeef";
                draw(u);
            </script></head></html>
        "#;
        let url = extract_login_url(html).unwrap();
        assert!(url.starts_with("https://login.b8n.cn/weixin/login/student/2?"));
        assert!(url.contains("sess=abc123"));
        assert!(url.contains("sign=deadbeef"));
    }

    #[test]
    fn test_extract_login_url_missing_script() {
        let html = "<html><body>nothing here</body></html>";
        assert!(extract_login_url(html).is_err());
    }
}
