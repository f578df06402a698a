//! Gradescope over HTTPS
//!
//! Fetch calls send the session as a fixed `Cookie` header and never store
//! response cookies, so the session stays read-only while workers share the
//! client. Only `login` uses a cookie jar, to capture the fresh session.

use super::parse::{parse_listing_page, parse_thread_page, selector};
use super::GradingPlatform;
use crate::error::{CoreError, TransientKind};
use crate::models::{AssignmentId, ListingEntry, ListingPage, ThreadDetail};
use crate::session::{Authenticator, Credentials, Session};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{COOKIE, ORIGIN, REFERER};
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const USER_AGENT: &str = concat!("regrade/", env!("CARGO_PKG_VERSION"));

/// Body returned by `/login` to an already authenticated session
const LOGGED_IN_WARNING: &str = "You must be logged out to access this page.";

static AUTH_TOKEN: Lazy<Selector> =
    Lazy::new(|| selector(r#"form input[name="authenticity_token"]"#));
static LOGIN_BUTTON: Lazy<Selector> =
    Lazy::new(|| selector(r#"input[type="submit"][value="Log In"]"#));
static LOGIN_ALERT: Lazy<Selector> = Lazy::new(|| selector(".alert-error span"));

/// HTTP client for the Gradescope web UI
#[derive(Clone)]
pub struct GradescopeClient {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl GradescopeClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CoreError> {
        let base_url = Url::parse(base_url).map_err(|e| CoreError::InvalidConfig {
            message: format!("invalid base URL {}: {}", base_url, e),
        })?;
        let client = Self::builder(timeout)
            .build()
            .map_err(|e| CoreError::InvalidConfig {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    fn builder(timeout: Duration) -> reqwest::ClientBuilder {
        Client::builder().user_agent(USER_AGENT).timeout(timeout)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn login_url(&self) -> Result<Url, CoreError> {
        self.base_url
            .join("/login")
            .map_err(|e| CoreError::InvalidConfig {
                message: format!("invalid base URL {}: {}", self.base_url, e),
            })
    }

    /// GET a page with the session cookies and return its body
    async fn get_text(&self, session: &Session, url: &str) -> Result<String, CoreError> {
        debug!(%url, "GET");
        let response = self
            .client
            .get(url)
            .header(COOKIE, session.cookie_header())
            .send()
            .await
            .map_err(|e| CoreError::from_reqwest(url, &e, self.timeout))?;

        check_status(url, response.status())?;

        response
            .text()
            .await
            .map_err(|e| CoreError::from_reqwest(url, &e, self.timeout))
    }
}

fn check_status(url: &str, status: StatusCode) -> Result<(), CoreError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(CoreError::transient(url, TransientKind::RateLimited));
    }
    if !status.is_success() {
        return Err(CoreError::transient(url, TransientKind::Status(status.as_u16())));
    }
    Ok(())
}

/// `true` when the `/login` response shows the user is already signed in
fn login_page_shows_session(body: &str) -> bool {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if json.get("warning").and_then(|w| w.as_str()) == Some(LOGGED_IN_WARNING) {
            return true;
        }
    }
    let doc = Html::parse_document(body);
    doc.select(&LOGIN_BUTTON).next().is_none()
}

fn authenticity_token(body: &str) -> Option<String> {
    let doc = Html::parse_document(body);
    doc.select(&AUTH_TOKEN)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(str::to_string)
}

fn has_invalid_credentials_alert(body: &str) -> bool {
    let doc = Html::parse_document(body);
    doc.select(&LOGIN_ALERT).any(|span| {
        span.text()
            .collect::<String>()
            .contains("Invalid email/password combination")
    })
}

#[async_trait]
impl GradingPlatform for GradescopeClient {
    async fn fetch_listing_page(
        &self,
        session: &Session,
        assignment: &AssignmentId,
        cursor: Option<&str>,
    ) -> Result<ListingPage, CoreError> {
        let page_url = match cursor {
            Some(next) => Url::parse(next).map_err(|e| CoreError::parse(next, e.to_string()))?,
            None => assignment.regrade_requests_url(&self.base_url)?,
        };
        let body = self.get_text(session, page_url.as_str()).await?;
        parse_listing_page(&body, &page_url)
    }

    async fn fetch_thread(
        &self,
        session: &Session,
        entry: &ListingEntry,
    ) -> Result<ThreadDetail, CoreError> {
        let body = self.get_text(session, &entry.review_link).await?;
        parse_thread_page(&body, entry)
    }
}

#[async_trait]
impl Authenticator for GradescopeClient {
    async fn probe(&self, session: &Session) -> Result<bool, CoreError> {
        let url = self.login_url()?;
        let body = self.get_text(session, url.as_str()).await?;
        Ok(login_page_shows_session(&body))
    }

    async fn login(&self, credentials: &Credentials) -> Result<Session, CoreError> {
        let login_url = self.login_url()?;
        let url = login_url.as_str();

        let jar = Arc::new(Jar::default());
        let client = Self::builder(self.timeout)
            .cookie_provider(jar.clone())
            .build()
            .map_err(|e| CoreError::authentication(format!("failed to build HTTP client: {}", e)))?;

        // The login form carries a CSRF token tied to the pre-login cookies
        let form_page = client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::from_reqwest(url, &e, self.timeout))?;
        check_status(url, form_page.status())?;
        let form_body = form_page
            .text()
            .await
            .map_err(|e| CoreError::from_reqwest(url, &e, self.timeout))?;
        let token = authenticity_token(&form_body)
            .ok_or_else(|| CoreError::parse(url, "login form has no authenticity_token"))?;

        let origin = self.base_url.origin().ascii_serialization();
        let response = client
            .post(url)
            .header(ORIGIN, origin)
            .header(REFERER, url)
            .form(&[
                ("utf8", "✓"),
                ("authenticity_token", token.as_str()),
                ("session[email]", credentials.email.as_str()),
                ("session[password]", credentials.password.as_str()),
                ("session[remember_me]", "1"),
                ("commit", "Log In"),
                ("session[remember_me_sso]", "0"),
            ])
            .send()
            .await
            .map_err(|e| CoreError::from_reqwest(url, &e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::from_reqwest(url, &e, self.timeout))?;

        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            return Err(CoreError::authentication(format!("login rejected (status {})", status)));
        }
        check_status(url, status)?;
        if has_invalid_credentials_alert(&body) {
            return Err(CoreError::authentication("invalid email/password combination"));
        }

        let cookies = jar
            .cookies(&self.base_url)
            .and_then(|header| header.to_str().ok().map(str::to_string))
            .ok_or_else(|| CoreError::authentication("login returned no session cookies"))?;

        info!(email = %credentials.email, "Authenticated with Gradescope");
        Ok(Session::from_cookie_header(&cookies))
    }
}
