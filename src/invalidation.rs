//! Maps a completed write to the cache keys it makes stale.
//!
//! Matching is by substring on the cache key and deliberately coarse: an
//! extra purge only costs a refetch, a missed one serves stale data.

use tracing::debug;

use crate::store::LocalStore;

/// Resource stem found in a written path -> substrings of cache keys to purge.
///
/// Stems cover singular, plural and camelCase action names alike
/// (`participant` matches `/participants/7` and `saveParticipant`). A new
/// resource type needs one row here; paths matching no row fall back to
/// their first resource segment (see [`affected_fragments`]).
const INVALIDATION_RULES: &[(&str, &[&str])] = &[
  (
    "participant",
    &["participant", "group", "attendance", "point", "honor", "badge"],
  ),
  ("group", &["group", "participant", "point"]),
  ("attendance", &["attendance", "participant", "activit"]),
  ("point", &["point", "participant", "group", "honor"]),
  ("honor", &["honor", "participant", "point"]),
  ("badge", &["badge", "participant"]),
  ("activit", &["activit", "calendar", "attendance"]),
  ("calendar", &["calendar", "activit"]),
  ("form", &["form", "participant"]),
];

/// Verbs legacy clients prefix onto camelCase action names.
const ACTION_VERBS: &[&str] = &["save", "update", "create", "delete", "remove", "add", "set"];

/// Lowercase cache-key substrings invalidated by a successful write to
/// `written_path`.
pub fn affected_fragments(written_path: &str) -> Vec<String> {
  let path = written_path.to_lowercase();
  let mut fragments: Vec<String> = Vec::new();

  for (stem, targets) in INVALIDATION_RULES {
    if path.contains(stem) {
      for target in *targets {
        if !fragments.iter().any(|f| f == target) {
          fragments.push(target.to_string());
        }
      }
    }
  }

  if fragments.is_empty() {
    if let Some(segment) = resource_segment(written_path) {
      fragments.push(resource_stem(segment));
    }
  }

  fragments
}

/// First path segment that names a resource: skips `api`, version markers
/// (`v1`, `v2`, ...) and numeric ids.
fn resource_segment(path: &str) -> Option<&str> {
  path
    .split('?')
    .next()
    .unwrap_or_default()
    .split('/')
    .filter(|s| !s.is_empty())
    .find(|s| {
      !s.eq_ignore_ascii_case("api")
        && !is_version_marker(s)
        && !s.chars().all(|c| c.is_ascii_digit())
    })
}

/// Lowercase stem of a segment: `saveReminder` and `Reminders` both give
/// `reminder`.
fn resource_stem(segment: &str) -> String {
  let mut name = segment;
  for verb in ACTION_VERBS {
    if let Some(rest) = segment.strip_prefix(verb) {
      if rest.starts_with(|c: char| c.is_ascii_uppercase()) {
        name = rest;
        break;
      }
    }
  }

  let lowered = name.to_lowercase();
  match lowered.strip_suffix('s') {
    Some(stem) if stem.len() >= 3 && !stem.ends_with('s') => stem.to_string(),
    _ => lowered,
  }
}

fn is_version_marker(segment: &str) -> bool {
  let mut chars = segment.chars();
  matches!(chars.next(), Some('v' | 'V'))
    && segment.len() > 1
    && chars.all(|c| c.is_ascii_digit())
}

/// Purge every cache key made stale by a write to `written_path`.
///
/// Returns the number of entries deleted.
pub fn invalidate(store: &LocalStore, written_path: &str) -> usize {
  let fragments = affected_fragments(written_path);
  if fragments.is_empty() {
    debug!(path = written_path, "Write maps to no cache keys");
    return 0;
  }

  let mut purged = 0;
  for key in store.cache_keys() {
    let lowered = key.to_lowercase();
    if fragments.iter().any(|f| lowered.contains(f.as_str())) && store.delete_cached(&key) {
      purged += 1;
    }
  }

  debug!(path = written_path, purged, "Invalidated cache entries");
  purged
}
