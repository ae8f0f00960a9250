//! The bundle file server: `GET /<name>.bundle` serves exactly the files
//! directly under the configured root that carry the `.bundle` suffix.
//! Anything else, including traversal attempts, is not found.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use axum::extract::{Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::rpc::RpcApiContext;

/// Maps a request path onto a file under the root, or the status to answer
/// with instead.
fn resolve_bundle_path(root: &Path, name: &str) -> Result<PathBuf, StatusCode> {
    // Single path component, no traversal.
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    if !name.ends_with(".bundle") {
        return Err(StatusCode::NOT_FOUND);
    }
    let candidate = root.join(name);
    match candidate.canonicalize() {
        Ok(resolved) => {
            let canonical_root = root.canonicalize().map_err(|_| StatusCode::FORBIDDEN)?;
            if resolved.starts_with(&canonical_root) {
                Ok(resolved)
            } else {
                Err(StatusCode::NOT_FOUND)
            }
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::FORBIDDEN),
    }
}

pub async fn serve_bundle(
    State(context): State<RpcApiContext>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    let Some(root) = context.bundle_root.as_deref() else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let path = match resolve_bundle_path(root, &name) {
        Ok(path) => path,
        Err(status) => {
            debug!("Refusing bundle request {name:?}: {status}");
            return status.into_response();
        }
    };
    match tokio::fs::read(&path).await {
        Ok(contents) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            contents,
        )
            .into_response(),
        Err(err) if err.kind() == ErrorKind::NotFound => StatusCode::NOT_FOUND.into_response(),
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            StatusCode::FORBIDDEN.into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn bundle_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("foo.bundle"), r#"{"module":"foo"}"#).expect("write");
        fs::write(dir.path().join("foo.js"), "not a bundle").expect("write");
        dir
    }

    #[test]
    fn serves_only_bundle_suffixed_names() {
        let root = bundle_root();
        assert!(resolve_bundle_path(root.path(), "foo.bundle").is_ok());
        assert_eq!(
            resolve_bundle_path(root.path(), "foo.js"),
            Err(StatusCode::NOT_FOUND)
        );
        assert_eq!(
            resolve_bundle_path(root.path(), "missing.bundle"),
            Err(StatusCode::NOT_FOUND)
        );
    }

    #[test]
    fn refuses_directory_escapes() {
        let root = bundle_root();
        // A sibling outside the root must stay invisible even with a valid
        // suffix.
        let outside = root.path().parent().expect("parent").join("escape.bundle");
        fs::write(&outside, "{}").expect("write");
        assert_eq!(
            resolve_bundle_path(root.path(), "../escape.bundle"),
            Err(StatusCode::NOT_FOUND)
        );
        assert_eq!(
            resolve_bundle_path(root.path(), "a/b.bundle"),
            Err(StatusCode::NOT_FOUND)
        );
        assert_eq!(
            resolve_bundle_path(root.path(), ""),
            Err(StatusCode::NOT_FOUND)
        );
        let _ = fs::remove_file(outside);
    }
}
