use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use reqwest::{header, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{ApiError, ArchiveApi};
use crate::models::{ChangeListItem, ContentKind, Item, ItemDraft, Query};
use crate::settings::SettingsStore;

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct SignInRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// reqwest-backed [`ArchiveApi`].
///
/// The session cookie is kept in the settings store so it survives restarts;
/// a 401 from any endpoint wipes it.
pub struct HttpArchiveApi {
    client: reqwest::Client,
    base_url: Url,
    settings: Arc<SettingsStore>,
}

impl HttpArchiveApi {
    pub fn new(base_url: impl AsRef<str>, settings: Arc<SettingsStore>) -> Result<Self> {
        let base_url = base_url.as_ref();
        let parsed = Url::parse(base_url)
            .with_context(|| format!("invalid archive server URL {base_url}"))?;
        if parsed.cannot_be_a_base() {
            bail!("archive server URL {base_url} cannot take a path");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("folio/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: parsed,
            settings,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Exchange credentials for a session cookie.
    pub async fn sign_in(&self, username: &str, password: &str) -> Result<(), ApiError> {
        let response = self
            .request(Method::POST, &["sign-in"])
            .json(&SignInRequest { username, password })
            .send()
            .await?;
        let response = self.check(response).await?;

        let cookie = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next())
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .collect::<Vec<_>>()
            .join("; ");

        if cookie.is_empty() {
            return Err(ApiError::Decode("sign-in response carried no session cookie".into()));
        }

        self.store_cookie(Some(cookie));
        info!("Signed in to {}", self.base_url);
        Ok(())
    }

    pub fn sign_out(&self) {
        self.store_cookie(None);
    }

    pub fn is_signed_in(&self) -> bool {
        self.settings.session_cookie().is_some()
    }

    fn store_cookie(&self, cookie: Option<String>) {
        if let Err(err) = self.settings.set_session_cookie(cookie) {
            warn!("Failed to persist session cookie: {err:#}");
        }
    }

    /// `{base_url}/api/{segments...}` with every segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("api").extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let builder = self.client.request(method, self.endpoint(segments));
        match self.settings.session_cookie() {
            Some(cookie) => builder.header(header::COOKIE, cookie),
            None => builder,
        }
    }

    /// Map non-success responses onto [`ApiError`], clearing the session on 401.
    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED {
            warn!("Session rejected by {}; clearing stored credentials", self.base_url);
            self.store_cookie(None);
            return Err(ApiError::Unauthorized);
        }

        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => (parsed.code, parsed.message),
            Err(_) => ("unknown".to_string(), body),
        };
        Err(ApiError::Status {
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ApiError> {
        let response = self.check(builder.send().await?).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))
    }
}

fn page_params(query: &Query) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("offset", query.offset.to_string()),
        ("limit", query.limit.to_string()),
    ];
    let filter = &query.content_filter;
    if !filter.tags.is_empty() {
        params.push(("tags", join(&filter.tags)));
    }
    if !filter.categories.is_empty() {
        params.push(("categories", join(&filter.categories)));
    }
    if let Some(temporal) = query.temporal_filter {
        params.push(("year", temporal.year.to_string()));
        if let Some(month) = temporal.month {
            params.push(("month", month.to_string()));
        }
    }
    params
}

fn join<'a>(values: impl IntoIterator<Item = &'a String>) -> String {
    values
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ArchiveApi for HttpArchiveApi {
    async fn fetch_page(&self, query: &Query) -> Result<Vec<Item>, ApiError> {
        let builder = self
            .request(Method::GET, &[query.kind.as_str()])
            .query(&page_params(query));
        self.send_json(builder).await
    }

    async fn fetch_item(&self, kind: ContentKind, id: &str) -> Result<Item, ApiError> {
        self.send_json(self.request(Method::GET, &[kind.as_str(), id]))
            .await
    }

    async fn upsert_item(
        &self,
        kind: ContentKind,
        id: Option<&str>,
        draft: &ItemDraft,
    ) -> Result<String, ApiError> {
        let builder = match id {
            Some(id) => self.request(Method::PUT, &[kind.as_str(), id]),
            None => self.request(Method::POST, &[kind.as_str()]),
        };
        let response: UpsertResponse = self.send_json(builder.json(draft)).await?;
        Ok(response.id)
    }

    async fn fetch_change_list(
        &self,
        collection: &str,
        after: Option<&str>,
    ) -> Result<Vec<ChangeListItem>, ApiError> {
        let mut builder = self.request(Method::GET, &["changelist", collection]);
        if let Some(after) = after {
            builder = builder.query(&[("after", after)]);
        }
        self.send_json(builder).await
    }

    async fn ping(&self) -> Result<(), ApiError> {
        let response = self.request(Method::GET, &["health"]).send().await?;
        self.check(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::models::ContentFilter;
    use crate::settings::EnvOverrides;

    fn settings(dir: &tempfile::TempDir) -> Arc<SettingsStore> {
        Arc::new(
            SettingsStore::with_overrides(dir.path().join("settings.json"), EnvOverrides::default())
                .unwrap(),
        )
    }

    fn item_json(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "kind": "articles",
            "title": format!("Article {id}"),
            "tags": ["rust"],
            "publishedAt": "2024-03-01T12:00:00Z",
            "updatedAt": "2024-03-01T12:00:00Z"
        })
    }

    #[tokio::test]
    async fn fetch_page_sends_filters_and_cookie() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        settings
            .set_session_cookie(Some("session=abc".into()))
            .unwrap();

        Mock::given(method("GET"))
            .and(path("/api/articles"))
            .and(query_param("offset", "6"))
            .and(query_param("limit", "6"))
            .and(query_param("tags", "async,rust"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([item_json("a1")])))
            .expect(1)
            .mount(&server)
            .await;

        let api = HttpArchiveApi::new(server.uri(), settings).unwrap();
        let query = Query::new(ContentKind::Articles)
            .with_offset(6)
            .with_filter(ContentFilter::default().with_tag("rust").with_tag("async"));
        let items = api.fetch_page(&query).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "a1");
        assert_eq!(items[0].tags, vec!["rust".to_string()]);
    }

    #[tokio::test]
    async fn unauthorized_clears_session() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        settings
            .set_session_cookie(Some("session=stale".into()))
            .unwrap();

        Mock::given(method("GET"))
            .and(path("/api/talks/t1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let api = HttpArchiveApi::new(server.uri(), settings.clone()).unwrap();
        let err = api.fetch_item(ContentKind::Talks, "t1").await.unwrap_err();

        assert_eq!(err, ApiError::Unauthorized);
        assert_eq!(settings.session_cookie(), None);
    }

    #[tokio::test]
    async fn ids_are_encoded_as_one_path_segment() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .and(path("/api/articles/a%2Fb%3Fc%23d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(item_json("a/b?c#d")))
            .expect(1)
            .mount(&server)
            .await;

        let api = HttpArchiveApi::new(server.uri(), settings(&dir)).unwrap();
        let item = api.fetch_item(ContentKind::Articles, "a/b?c#d").await.unwrap();
        assert_eq!(item.id, "a/b?c#d");
    }

    #[tokio::test]
    async fn undecodable_error_body_is_unknown() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        Mock::given(method("GET"))
            .and(path("/api/changelist/articles"))
            .and(query_param("after", "41"))
            .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
            .mount(&server)
            .await;

        let api = HttpArchiveApi::new(server.uri(), settings(&dir)).unwrap();
        let err = api
            .fetch_change_list("articles", Some("41"))
            .await
            .unwrap_err();

        match err {
            ApiError::Status { status, code, .. } => {
                assert_eq!(status, 502);
                assert_eq!(code, "unknown");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn upsert_posts_new_and_puts_existing() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let draft = ItemDraft {
            title: "Hello".into(),
            summary: None,
            tags: vec![],
            categories: vec![],
            body: json!({}),
            published_at: None,
        };

        Mock::given(method("POST"))
            .and(path("/api/projects"))
            .and(body_json(serde_json::to_value(&draft).unwrap()))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "p9" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/projects/p9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "p9" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/projects/p10"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(json!({ "code": "invalid_title", "message": "too short" })),
            )
            .mount(&server)
            .await;

        let api = HttpArchiveApi::new(server.uri(), settings(&dir)).unwrap();
        assert_eq!(
            api.upsert_item(ContentKind::Projects, None, &draft).await.unwrap(),
            "p9"
        );
        assert_eq!(
            api.upsert_item(ContentKind::Projects, Some("p9"), &draft)
                .await
                .unwrap(),
            "p9"
        );
        assert_eq!(
            api.upsert_item(ContentKind::Projects, Some("p10"), &draft)
                .await
                .unwrap_err(),
            ApiError::Status {
                status: 422,
                code: "invalid_title".into(),
                message: "too short".into(),
            }
        );
    }

    #[tokio::test]
    async fn sign_in_stores_cookie() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);

        Mock::given(method("POST"))
            .and(path("/api/sign-in"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "session=fresh; Path=/; HttpOnly"),
            )
            .mount(&server)
            .await;

        let api = HttpArchiveApi::new(server.uri(), settings.clone()).unwrap();
        api.sign_in("ada", "hunter2").await.unwrap();

        assert!(api.is_signed_in());
        assert_eq!(settings.session_cookie(), Some("session=fresh".into()));

        api.sign_out();
        assert!(!api.is_signed_in());
    }
}
