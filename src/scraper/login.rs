//! Form login and age-gate exchange against the source site.

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{redirect, Response, Url};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::http::browser_headers;
use super::session::{cookie_header, Authenticator, CookieSet, AGE_GATE_COOKIE};
use super::SITE_REFERER;
use crate::config::ScraperConfig;
use crate::error::ScrapeError;

/// Cookies that indicate the login produced a session
const SESSION_COOKIES: [&str; 2] = ["user_id", "PHPSESSID"];

const MAX_REDIRECTS: usize = 5;

/// Logs in with the configured account over plain HTTP requests
pub struct HttpAuthenticator {
    client: reqwest::Client,
    login_page_url: String,
    login_url: String,
    age_gate_url: String,
    email: Option<String>,
    password: Option<String>,
}

impl HttpAuthenticator {
    pub fn new(config: &ScraperConfig) -> anyhow::Result<Self> {
        // Redirects are followed by hand so each hop's Set-Cookie is kept
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            login_page_url: config.login_page_url.clone(),
            login_url: config.login_url.clone(),
            age_gate_url: config.age_gate_url.clone(),
            email: config.email.clone(),
            password: config.password.clone(),
        })
    }

    fn ajax_headers(referer: &str) -> HeaderMap {
        let mut headers = browser_headers();
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        if let Ok(value) = HeaderValue::from_str(referer) {
            headers.insert(header::REFERER, value);
        }
        headers
    }

    async fn post_form(
        &self,
        url: &str,
        referer: &str,
        form: &[(&str, &str)],
        cookies: &mut CookieSet,
    ) -> Result<String, ScrapeError> {
        let mut request = self
            .client
            .post(url)
            .headers(Self::ajax_headers(referer))
            .form(form);
        if !cookies.is_empty() {
            request = request.header(header::COOKIE, cookie_header(cookies));
        }
        let response = request.send().await?;
        let response = self.follow_redirects(response, cookies).await?.error_for_status()?;
        Ok(response.text().await?)
    }

    /// Collect cookies from `response` and any redirects after it
    async fn follow_redirects(
        &self,
        mut response: Response,
        cookies: &mut CookieSet,
    ) -> Result<Response, ScrapeError> {
        for _ in 0..MAX_REDIRECTS {
            absorb_set_cookies(response.headers(), cookies);
            if !response.status().is_redirection() {
                return Ok(response);
            }
            let Some(next) = redirect_target(response.url(), response.headers()) else {
                return Ok(response);
            };
            debug!("Following redirect to {}", next);
            let mut request = self.client.get(next).headers(browser_headers());
            if !cookies.is_empty() {
                request = request.header(header::COOKIE, cookie_header(cookies));
            }
            response = request.send().await?;
        }
        Err(ScrapeError::LoginFailed(format!(
            "more than {} redirects",
            MAX_REDIRECTS
        )))
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn login(&self) -> Result<CookieSet, ScrapeError> {
        let (Some(email), Some(password)) = (self.email.as_deref(), self.password.as_deref())
        else {
            return Err(ScrapeError::LoginFailed(
                "HKJC_SCRAPER__EMAIL and HKJC_SCRAPER__PASSWORD must be set".to_string(),
            ));
        };

        let mut cookies = CookieSet::new();

        info!("Establishing session at {}", self.login_page_url);
        let response = self
            .client
            .get(&self.login_page_url)
            .headers(browser_headers())
            .send()
            .await?;
        self.follow_redirects(response, &mut cookies)
            .await?
            .error_for_status()?;

        info!("Submitting login credentials");
        let body = self
            .post_form(
                &self.login_url,
                &self.login_page_url,
                &[
                    ("action", "login"),
                    ("fp[email_or_username]", email),
                    ("fp[password]", password),
                    ("fp[is_remember_me]", "1"),
                ],
                &mut cookies,
            )
            .await?;

        if let Some(message) = login_error(&body) {
            return Err(ScrapeError::LoginFailed(message));
        }
        if !SESSION_COOKIES.iter().any(|name| cookies.contains_key(*name)) {
            return Err(ScrapeError::LoginFailed(
                "login response carried no session cookies".to_string(),
            ));
        }

        info!("Login succeeded ({} cookies)", cookies.len());
        Ok(cookies)
    }

    async fn pass_age_gate(&self, cookies: &CookieSet) -> Result<Option<String>, ScrapeError> {
        let mut cookies = cookies.clone();
        self.post_form(
            &self.age_gate_url,
            SITE_REFERER,
            &[("action", "set_18")],
            &mut cookies,
        )
        .await?;

        match cookies.remove(AGE_GATE_COOKIE) {
            Some(value) => {
                info!("Passed age verification gate");
                Ok(Some(value))
            }
            None => {
                warn!("Age gate response did not set {}", AGE_GATE_COOKIE);
                Ok(None)
            }
        }
    }
}

/// Merge `Set-Cookie` headers into `cookies`
fn absorb_set_cookies(headers: &HeaderMap, cookies: &mut CookieSet) {
    for value in headers.get_all(header::SET_COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        if let Some((name, value)) = parse_set_cookie(raw) {
            debug!("Received cookie {}", name);
            cookies.insert(name, value);
        }
    }
}

/// Absolute target of a redirect response
fn redirect_target(base: &Url, headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(header::LOCATION)?.to_str().ok()?;
    base.join(location).ok()
}

/// Name and value of a `Set-Cookie` header, ignoring attributes
fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let pair = raw.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().trim_matches('"').to_string()))
}

/// Error message from the login endpoint's JSON reply, if it reports one
fn login_error(body: &str) -> Option<String> {
    let reply: serde_json::Value = serde_json::from_str(body).ok()?;
    let status_error = reply.get("status").and_then(|s| s.as_str()) == Some("error");
    let flagged = match reply.get("error") {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Null) | None => false,
        Some(serde_json::Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    };
    if status_error || flagged {
        let message = reply
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown");
        Some(message.to_string())
    } else {
        None
    }
}
