/// Returns true if a `git config --get` exit code means "key not set".
///
/// Known codes:
/// - 1: the section or key is invalid or not present
pub fn is_config_key_missing(exit_code: i32) -> bool {
    exit_code == 1
}

/// Returns true if a `git rev-parse --verify --quiet` exit code means the
/// revision does not resolve (e.g. `HEAD` on an unborn branch).
pub fn is_unresolved_revision(exit_code: i32) -> bool {
    exit_code == 1
}
