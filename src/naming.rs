//! Name normalization and generation for projects and agents.

const ADJECTIVES: &[&str] = &[
    "Red", "Orange", "Pink", "Black", "Purple", "Blue", "Brown", "White", "Green", "Chartreuse",
    "Lilac", "Fuchsia",
];

const NOUNS: &[&str] = &[
    "Stone", "Lake", "Dog", "Creek", "Pond", "Cat", "Bear", "Mountain", "Hill", "Snow", "Castle",
];

/// Normalize a human-readable project key into a slug: lowercase, runs of
/// non-alphanumerics collapsed to single hyphens. Empty input slugs to
/// "project" so a slug is always a valid directory name.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_hyphen = false;
    for c in value.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    if slug.is_empty() { "project".into() } else { slug }
}

/// Strip an agent name down to alphanumerics, hyphen and underscore.
/// Returns `None` when nothing alphanumeric survives.
pub fn sanitize_agent_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.chars().any(|c| c.is_ascii_alphanumeric()) {
        Some(cleaned)
    } else {
        None
    }
}

/// Random adjective+noun codename, e.g. "GreenCastle".
pub fn generate_agent_name() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let noun = NOUNS[bytes[1] as usize % NOUNS.len()];
    format!("{adjective}{noun}")
}
