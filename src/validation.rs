//! Input validation for security-critical operations.
//!
//! Sandbox slugs and image references are both interpolated into
//! container-CLI arguments; validating them here keeps that concern out
//! of every call site.

use crate::error::{Error, Result};

const MAX_SANDBOX_NAME_LEN: usize = 63;

/// Validate a sandbox slug.
///
/// Valid slugs start and end with an alphanumeric character, contain only
/// alphanumerics/hyphens/underscores, are 1-63 characters, and never
/// contain consecutive separators.
pub fn validate_sandbox_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("slug", "required", "sandbox slug cannot be empty"));
    }
    if name.len() > MAX_SANDBOX_NAME_LEN {
        return Err(Error::invalid(
            "slug",
            "too_long",
            format!("sandbox slug too long (max {MAX_SANDBOX_NAME_LEN} characters)"),
        ));
    }

    let first = name.chars().next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(Error::invalid("slug", "invalid_format", "sandbox slug must start with a letter or number"));
    }
    let last = name.chars().last().unwrap();
    if !last.is_ascii_alphanumeric() {
        return Err(Error::invalid("slug", "invalid_format", "sandbox slug must end with a letter or number"));
    }

    for ch in name.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '-' && ch != '_' {
            return Err(Error::invalid(
                "slug",
                "invalid_format",
                format!("sandbox slug contains invalid character '{ch}'"),
            ));
        }
    }

    if name.contains("--") || name.contains("__") || name.contains("-_") || name.contains("_-") {
        return Err(Error::invalid("slug", "invalid_format", "sandbox slug cannot contain consecutive separators"));
    }

    Ok(())
}

/// Sanitize a Docker/Podman image reference before it reaches the CLI.
pub fn validate_docker_image(image: &str) -> Result<()> {
    if image.is_empty() {
        return Err(Error::invalid("image", "required", "image reference cannot be empty"));
    }
    if image.len() > 256 {
        return Err(Error::invalid("image", "too_long", "image reference too long (max 256 characters)"));
    }

    for ch in image.chars() {
        if !ch.is_ascii_alphanumeric() && !"._-/:@".contains(ch) {
            return Err(Error::invalid(
                "image",
                "invalid_format",
                format!("image reference contains invalid character '{ch}'"),
            ));
        }
    }

    let dangerous_patterns = ["$(", "`", "&&", "||", ";", "|", ">", "<", "\n"];
    for pattern in dangerous_patterns {
        if image.contains(pattern) {
            return Err(Error::invalid(
                "image",
                "invalid_format",
                format!("image reference contains suspicious pattern: {pattern}"),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_sandbox_names() {
        assert!(validate_sandbox_name("my-sandbox").is_ok());
        assert!(validate_sandbox_name("test123").is_ok());
        assert!(validate_sandbox_name("My_Sandbox_1").is_ok());
        assert!(validate_sandbox_name("a").is_ok());
    }

    #[test]
    fn invalid_sandbox_names() {
        assert!(validate_sandbox_name("").is_err());
        assert!(validate_sandbox_name(&"a".repeat(64)).is_err());
        assert!(validate_sandbox_name("test;rm -rf /").is_err());
        assert!(validate_sandbox_name("test$(whoami)").is_err());
        assert!(validate_sandbox_name("test`id`").is_err());
        assert!(validate_sandbox_name("-test").is_err());
        assert!(validate_sandbox_name("test-").is_err());
        assert!(validate_sandbox_name("test--name").is_err());
        assert!(validate_sandbox_name("test__name").is_err());
    }

    #[test]
    fn valid_docker_images() {
        assert!(validate_docker_image("alpine:3.20").is_ok());
        assert!(validate_docker_image("python:3.12-alpine").is_ok());
        assert!(validate_docker_image("ghcr.io/user/image:latest").is_ok());
        assert!(validate_docker_image("image@sha256:abc123").is_ok());
    }

    #[test]
    fn invalid_docker_images() {
        assert!(validate_docker_image("").is_err());
        assert!(validate_docker_image("alpine; rm -rf /").is_err());
        assert!(validate_docker_image("alpine$(whoami)").is_err());
        assert!(validate_docker_image("alpine`id`").is_err());
    }
}
