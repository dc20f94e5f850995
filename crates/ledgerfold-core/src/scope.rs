use std::collections::BTreeMap;

/// Separator between a scope and a local name.
pub const SEPARATOR: char = '.';

/// Qualify `name` with `scope`. An empty scope leaves the name unchanged.
pub fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}{SEPARATOR}{name}")
    }
}

/// Return the scope part of a qualified name, or `""` if it has none.
///
/// `"scope."` still yields `"scope"`.
pub fn scope_of(name: &str) -> &str {
    match name.split_once(SEPARATOR) {
        Some((scope, _)) => scope,
        None => "",
    }
}

/// Rewrite every key of a handler list through [`qualify`].
///
/// Later entries replace earlier ones that qualify to the same name.
pub fn qualify_all<H>(
    scope: &str,
    handlers: impl IntoIterator<Item = (String, H)>,
) -> BTreeMap<String, H> {
    handlers
        .into_iter()
        .map(|(name, handler)| (qualify(scope, &name), handler))
        .collect()
}
