//! Negotiation with the SignalR server.
//!
//! Before establishing a WebSocket connection, the client performs an HTTP
//! POST to the `/negotiate` endpoint to obtain a connection token, and
//! possibly a redirect to another endpoint.

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::HubError;
use crate::options::HubOptions;

/// Servers may chain redirects; give up after this many hops.
const MAX_REDIRECTS: usize = 100;

/// Response from the `/negotiate` endpoint.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    connection_id: Option<String>,
    connection_token: Option<String>,
    url: Option<String>,
    access_token: Option<String>,
    #[serde(default)]
    available_transports: Option<Vec<AvailableTransport>>,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AvailableTransport {
    transport: String,
}

/// Where and how to open the WebSocket after negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    /// Hub endpoint, possibly redirected.
    pub url: Url,
    /// Value of the `id` query parameter, if the server issued one.
    pub connection_token: Option<String>,
    /// Token to present on the upgrade request.
    pub access_token: Option<String>,
}

/// Builds the negotiate URL for a hub endpoint, keeping its query.
pub fn negotiate_url(hub_url: &Url) -> Url {
    let mut negotiate_url = hub_url.clone();

    let mut path = negotiate_url.path().to_string();
    if path.ends_with('/') && path.len() > 1 {
        path.pop();
    }
    path.push_str("/negotiate");
    negotiate_url.set_path(&path);
    negotiate_url.set_fragment(None);
    negotiate_url
        .query_pairs_mut()
        .append_pair("negotiateVersion", "1");

    negotiate_url
}

/// Performs the negotiate request, following redirects.
///
/// A `404` or `405` answer means the server does not require negotiation;
/// the hub URL is then used as is.
///
/// # Example
///
/// ```no_run
/// use signalrr_rx::negotiate::negotiate;
/// use signalrr_rx::HubOptions;
/// use url::Url;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let hub_url = Url::parse("http://localhost:5000/chathub")?;
/// let negotiated = negotiate(&hub_url, &HubOptions::default()).await?;
/// println!("Connection token: {:?}", negotiated.connection_token);
/// # Ok(())
/// # }
/// ```
pub async fn negotiate(hub_url: &Url, options: &HubOptions) -> Result<Negotiated, HubError> {
    let client = reqwest::Client::new();
    let mut url = hub_url.clone();
    let mut access_token = options.access_token.clone();

    for _ in 0..MAX_REDIRECTS {
        let negotiate_url = negotiate_url(&url);
        debug!(%negotiate_url, "Negotiating");

        let mut request = client
            .post(negotiate_url.as_str())
            .header("Accept", "application/json");
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND
            || status == reqwest::StatusCode::METHOD_NOT_ALLOWED
        {
            debug!(%status, "Negotiate not required");
            return Ok(Negotiated {
                url,
                connection_token: None,
                access_token,
            });
        }
        if !status.is_success() {
            return Err(HubError::Negotiate(format!(
                "unexpected status code {status}"
            )));
        }

        let raw: NegotiateResponse = response.json().await?;
        match resolve(raw)? {
            Step::Done(connection_token) => {
                return Ok(Negotiated {
                    url,
                    connection_token,
                    access_token,
                })
            }
            Step::Redirect {
                url: next,
                access_token: token,
            } => {
                debug!(redirect = %next, "Negotiate redirected");
                url = Url::parse(&next)?;
                if token.is_some() {
                    access_token = token;
                }
            }
        }
    }

    Err(HubError::Negotiate("too many redirects".to_string()))
}

#[derive(Debug, PartialEq)]
enum Step {
    Done(Option<String>),
    Redirect {
        url: String,
        access_token: Option<String>,
    },
}

fn resolve(raw: NegotiateResponse) -> Result<Step, HubError> {
    if let Some(error) = raw.error {
        return Err(HubError::Negotiate(error));
    }
    if let Some(url) = raw.url {
        return Ok(Step::Redirect {
            url,
            access_token: raw.access_token,
        });
    }
    if let Some(transports) = &raw.available_transports {
        if !transports.iter().any(|t| t.transport == "WebSockets") {
            return Err(HubError::Negotiate(
                "server does not offer the WebSockets transport".to_string(),
            ));
        }
    }
    Ok(Step::Done(raw.connection_token.or(raw.connection_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: serde_json::Value) -> NegotiateResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_negotiate_url_keeps_query() {
        let hub = Url::parse("https://example.com/hubs/chat/?tenant=7#frag").unwrap();
        let url = negotiate_url(&hub);
        assert_eq!(
            url.as_str(),
            "https://example.com/hubs/chat/negotiate?tenant=7&negotiateVersion=1"
        );
    }

    #[test]
    fn test_connection_token_preferred() {
        let raw = response(serde_json::json!({
            "connectionId": "abc",
            "connectionToken": "xyz",
            "negotiateVersion": 1,
            "availableTransports": [
                {"transport": "WebSockets", "transferFormats": ["Text", "Binary"]}
            ]
        }));
        assert_eq!(resolve(raw).unwrap(), Step::Done(Some("xyz".to_string())));
    }

    #[test]
    fn test_redirect() {
        let raw = response(serde_json::json!({
            "url": "https://other.example.com/chat",
            "accessToken": "t0ken"
        }));
        assert_eq!(
            resolve(raw).unwrap(),
            Step::Redirect {
                url: "https://other.example.com/chat".to_string(),
                access_token: Some("t0ken".to_string()),
            }
        );
    }

    #[test]
    fn test_server_error_and_missing_websockets() {
        let raw = response(serde_json::json!({"error": "Hub not found"}));
        assert!(matches!(resolve(raw), Err(HubError::Negotiate(e)) if e == "Hub not found"));

        let raw = response(serde_json::json!({
            "connectionId": "abc",
            "availableTransports": [{"transport": "LongPolling"}]
        }));
        assert!(matches!(resolve(raw), Err(HubError::Negotiate(_))));
    }
}
