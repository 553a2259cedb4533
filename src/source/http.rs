//! Blocking HTTP transport shared by the network loaders
//!
//! Redirects are not followed by the client. 3xx responses carrying a `Location`
//! header are re-issued by hand so that HTTP to HTTPS upgrades are visible here.

use super::SourceError;
use crate::config::LoaderSettings;
use reqwest::blocking::{Client, Response};
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;

fn build_client(settings: &LoaderSettings) -> Result<Client, SourceError> {
    Client::builder()
        .timeout(settings.timeout())
        .redirect(Policy::none())
        .user_agent(settings.user_agent.as_str())
        .build()
        .map_err(|e| SourceError::Transport(format!("Failed to create HTTP client: {}", e)))
}

fn map_request_error(err: reqwest::Error, url: &str, settings: &LoaderSettings) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout {
            seconds: settings.http_timeout_secs,
            url: url.to_string(),
        }
    } else {
        SourceError::Transport(format!("Failed to fetch {}: {}", url, err))
    }
}

/// Resolve a `Location` header against the URL that returned it
fn resolve_location(current: &str, location: &str) -> Result<String, SourceError> {
    let base = url::Url::parse(current)
        .map_err(|e| SourceError::Transport(format!("Invalid URL {}: {}", current, e)))?;
    base.join(location)
        .map(|u| u.to_string())
        .map_err(|e| SourceError::Transport(format!("Malformed redirect to '{}': {}", location, e)))
}

/// GET `url` and return the response body as a stream once a 2xx answer arrives
pub fn open_stream(url: &str, settings: &LoaderSettings) -> Result<Response, SourceError> {
    let client = build_client(settings)?;
    let mut current = url.to_string();

    for _ in 0..=settings.max_redirects {
        tracing::debug!("GET {}", current);
        let response = client
            .get(&current)
            .send()
            .map_err(|e| map_request_error(e, &current, settings))?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let Some(location) = location {
                let next = resolve_location(&current, &location)?;
                if current.starts_with("http://") && next.starts_with("https://") {
                    tracing::info!("Server upgraded {} to {}", current, next);
                } else {
                    tracing::debug!("Following redirect {} -> {}", current, next);
                }
                current = next;
                continue;
            }
        }

        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url: current,
            });
        }
        return Ok(response);
    }

    Err(SourceError::Transport(format!(
        "Too many redirects (more than {}) starting from {}",
        settings.max_redirects, url
    )))
}

/// Host (and port, when not the default) of `url`
pub fn host_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Replace the host (and optionally port) of `url` with `address`
pub fn replace_host(url: &str, address: &str) -> Result<String, SourceError> {
    let mut parsed = url::Url::parse(url)
        .map_err(|e| SourceError::Configuration(format!("Invalid URL {}: {}", url, e)))?;
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|e| SourceError::Configuration(format!("Invalid port in {}: {}", address, e)))?;
            (host, Some(port))
        }
        _ => (address, None),
    };
    parsed
        .set_host(Some(host))
        .map_err(|e| SourceError::Configuration(format!("Invalid server address {}: {}", address, e)))?;
    parsed
        .set_port(port)
        .map_err(|_| SourceError::Configuration(format!("Cannot set port on {}", url)))?;
    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(
            host_of("https://api.genome.ucsc.edu/getData").as_deref(),
            Some("api.genome.ucsc.edu")
        );
        assert_eq!(
            host_of("http://localhost:8080/das/hg19").as_deref(),
            Some("localhost:8080")
        );
        assert_eq!(host_of("not a url"), None);
    }

    #[test]
    fn test_replace_host_keeps_path() {
        let url = replace_host("http://genome.example.org/das/hg19", "mirror.example.net:9000").unwrap();
        assert_eq!(url, "http://mirror.example.net:9000/das/hg19");
        let url = replace_host("https://a.example.org:8443/api", "b.example.org").unwrap();
        assert_eq!(url, "https://b.example.org/api");
    }

    #[test]
    fn test_relative_redirects_resolve() {
        assert_eq!(
            resolve_location("http://a.example.org/das/dna?x=1", "/moved/dna?x=1").unwrap(),
            "http://a.example.org/moved/dna?x=1"
        );
        assert_eq!(
            resolve_location("http://a.example.org/das", "https://b.example.org/das").unwrap(),
            "https://b.example.org/das"
        );
    }
}
