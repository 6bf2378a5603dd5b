use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Which provider sent a push, inferred from which header/shape matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Github,
    Gitlab,
    Gitee,
}

/// Fields captured verbatim off a push event, per spec §4.6 step 3.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TriggerInfo {
    pub platform: Platform,
    pub branch: String,
    pub commit: String,
    pub pusher: String,
}

/// The subset of request headers the webhook receiver inspects, passed in
/// by the HTTP layer rather than depending on axum's header map here.
#[derive(Debug, Default)]
pub struct WebhookHeaders<'a> {
    pub github_signature: Option<&'a str>,
    pub gitlab_token: Option<&'a str>,
    pub gitee_token: Option<&'a str>,
}

/// Verify the platform-specific signature/token header against the
/// pipeline's `webhook_secret`. Returns `Ok(())` on a match or when no
/// secret is configured (spec §4.6 step 2: verification only applies
/// "if the pipeline carries a `webhook_secret`").
pub fn verify_signature(
    secret: Option<&str>,
    headers: &WebhookHeaders,
    body: &[u8],
) -> Result<(), ()> {
    let Some(secret) = secret else {
        return Ok(());
    };
    if secret.trim().is_empty() {
        return Ok(());
    }

    if let Some(sig) = headers.github_signature {
        return verify_github(secret, sig, body);
    }
    if let Some(tok) = headers.gitlab_token {
        return constant_time_eq(tok.as_bytes(), secret.as_bytes());
    }
    if let Some(tok) = headers.gitee_token {
        return constant_time_eq(tok.as_bytes(), secret.as_bytes());
    }

    // A secret is configured but no recognized header was sent.
    Err(())
}

fn verify_github(secret: &str, header_value: &str, body: &[u8]) -> Result<(), ()> {
    let given_hex = header_value.strip_prefix("sha256=").ok_or(())?;
    let given = hex::decode(given_hex).map_err(|_| ())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ())?;
    mac.update(body);
    mac.verify_slice(&given).map_err(|_| ())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> Result<(), ()> {
    if a.len() != b.len() {
        return Err(());
    }
    let diff = a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    if diff == 0 {
        Ok(())
    } else {
        Err(())
    }
}

#[derive(Deserialize)]
struct GithubPushPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    after: Option<String>,
    pusher: Option<GithubPusher>,
}

#[derive(Deserialize)]
struct GithubPusher {
    name: Option<String>,
}

#[derive(Deserialize)]
struct GitlabPushPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    checkout_sha: Option<String>,
    user_name: Option<String>,
    object_kind: Option<String>,
}

#[derive(Deserialize)]
struct GiteePushPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    after: Option<String>,
    pusher: Option<GiteePusher>,
}

#[derive(Deserialize)]
struct GiteePusher {
    name: Option<String>,
}

fn strip_ref_prefix(r: &str) -> String {
    r.strip_prefix("refs/heads/").unwrap_or(r).to_string()
}

/// Extract `{platform, branch, commit, pusher}` from a push payload.
/// `headers` disambiguates the provider (the same push-event JSON shape
/// can't always be told apart from content alone). Returns `None` for a
/// recognized non-push event (spec: "accepted and acknowledged but
/// produce no build").
pub fn extract_trigger_info(
    headers: &WebhookHeaders,
    body: &[u8],
) -> Result<Option<TriggerInfo>, String> {
    if headers.github_signature.is_some() || headers.gitlab_token.is_none() && headers.gitee_token.is_none() {
        // Try GitHub shape first as the default/most common case.
        if let Ok(p) = serde_json::from_slice::<GithubPushPayload>(body) {
            if let (Some(r), Some(after)) = (&p.git_ref, &p.after) {
                return Ok(Some(TriggerInfo {
                    platform: Platform::Github,
                    branch: strip_ref_prefix(r),
                    commit: after.clone(),
                    pusher: p.pusher.and_then(|p| p.name).unwrap_or_default(),
                }));
            }
        }
    }

    if headers.gitlab_token.is_some() {
        let p: GitlabPushPayload =
            serde_json::from_slice(body).map_err(|e| format!("malformed GitLab payload: {e}"))?;
        if p.object_kind.as_deref().is_some_and(|k| k != "push") {
            return Ok(None);
        }
        if let (Some(r), Some(sha)) = (&p.git_ref, &p.checkout_sha) {
            return Ok(Some(TriggerInfo {
                platform: Platform::Gitlab,
                branch: strip_ref_prefix(r),
                commit: sha.clone(),
                pusher: p.user_name.unwrap_or_default(),
            }));
        }
        return Ok(None);
    }

    if headers.gitee_token.is_some() {
        let p: GiteePushPayload =
            serde_json::from_slice(body).map_err(|e| format!("malformed Gitee payload: {e}"))?;
        if let (Some(r), Some(after)) = (&p.git_ref, &p.after) {
            return Ok(Some(TriggerInfo {
                platform: Platform::Gitee,
                branch: strip_ref_prefix(r),
                commit: after.clone(),
                pusher: p.pusher.and_then(|p| p.name).unwrap_or_default(),
            }));
        }
        return Ok(None);
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn github_signature_matches() {
        let body = br#"{"ref":"refs/heads/main","after":"abc123","pusher":{"name":"alice"}}"#;
        let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        let headers = WebhookHeaders {
            github_signature: Some(&sig),
            ..Default::default()
        };
        assert!(verify_signature(Some("s3cret"), &headers, body).is_ok());
    }

    #[test]
    fn github_signature_mismatch() {
        let body = br#"{"ref":"refs/heads/main","after":"abc123"}"#;
        let headers = WebhookHeaders {
            github_signature: Some("sha256=deadbeef"),
            ..Default::default()
        };
        assert!(verify_signature(Some("s3cret"), &headers, body).is_err());
    }

    #[test]
    fn no_secret_skips_verification() {
        let headers = WebhookHeaders::default();
        assert!(verify_signature(None, &headers, b"{}").is_ok());
    }

    #[test]
    fn github_push_extracts_branch_and_commit() {
        let body = br#"{"ref":"refs/heads/feature/x","after":"deadbeef","pusher":{"name":"bob"}}"#;
        let headers = WebhookHeaders::default();
        let info = extract_trigger_info(&headers, body).unwrap().unwrap();
        assert_eq!(info.branch, "feature/x");
        assert_eq!(info.commit, "deadbeef");
        assert_eq!(info.pusher, "bob");
        assert_eq!(info.platform, Platform::Github);
    }

    #[test]
    fn gitlab_non_push_event_produces_no_trigger() {
        let body = br#"{"object_kind":"tag_push","ref":"refs/tags/v1"}"#;
        let headers = WebhookHeaders {
            gitlab_token: Some("tok"),
            ..Default::default()
        };
        assert!(extract_trigger_info(&headers, body).unwrap().is_none());
    }
}
