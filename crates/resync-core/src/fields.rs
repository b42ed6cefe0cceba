//! Field inclusion rule shared by schema sync and record loading.

use crate::indexes::{is_indexed, Indexes};

/// Decides whether `field` is stored at a destination.
///
/// Indexed fields are always kept. Otherwise the platform predicate may drop a
/// field but never force one in, and an explicit selection list limits the rest.
pub fn should_include_field<F>(
    field: &str,
    indexes: &Indexes,
    platform_excludes: F,
    select: Option<&[String]>,
) -> bool
where
    F: Fn(&str) -> bool,
{
    if is_indexed(field, indexes) {
        return true;
    }
    if platform_excludes(field) {
        return false;
    }
    match select {
        Some(list) if !list.is_empty() => list.iter().any(|s| s == field),
        _ => true,
    }
}
