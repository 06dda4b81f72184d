//! Request header ordering.
//!
//! Two flags control the emitted order: `order_headers_as_provided` keeps
//! the caller's insertion order, and `header_order` gives an explicit
//! ordering prefix. When both are set the explicit list wins for the names
//! it mentions and insertion order governs the rest.

/// Resolve the final wire order of the request headers.
pub fn resolve_order(
    headers: Vec<(String, String)>,
    header_order: Option<&[String]>,
    _order_as_provided: bool,
) -> Vec<(String, String)> {
    let Some(order) = header_order.filter(|o| !o.is_empty()) else {
        // Insertion order is the only order we have; both flag states
        // preserve it.
        return headers;
    };

    let mut remaining: Vec<Option<(String, String)>> = headers.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(remaining.len());

    for wanted in order {
        for slot in remaining.iter_mut() {
            let matches = slot
                .as_ref()
                .is_some_and(|(name, _)| name.eq_ignore_ascii_case(wanted));
            if matches {
                out.push(slot.take().expect("slot checked above"));
            }
        }
    }

    // Unlisted headers keep their insertion order.
    out.extend(remaining.into_iter().flatten());
    out
}

/// Append a header unless one with the same name is already present.
pub fn set_default(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)) {
        headers.push((name.to_string(), value.to_string()));
    }
}
