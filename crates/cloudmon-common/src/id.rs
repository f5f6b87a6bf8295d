use uuid::Uuid;

/// Generate a fresh per-run sync token.
///
/// Every record written by one replace-latest commit carries the same token;
/// rows holding any other token for that provider are stale.
pub fn next_sync_token() -> String {
    Uuid::new_v4().simple().to_string()
}
