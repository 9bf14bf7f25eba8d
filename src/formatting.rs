use metrics::Key;

// Plaintext protocol, one metric per line:
// <metric.path> <value> <unix-timestamp>
// Graphite 1.1 tag support:
// <metric.path>;<tag>=<value>;<tag2>=<value2> <value> <unix-timestamp>

/// Replaces every `.` in a single namespace node with `_`.
///
/// Graphite treats `.` as a path separator, so an application name or
/// hostname containing dots would otherwise introduce spurious hierarchy
/// levels.  No other characters are altered, and re-sanitizing an already
/// sanitized node is a no-op.
pub fn sanitize_path_node(node: &str) -> String {
    node.replace('.', "_")
}

/// Computes the namespace prefix prepended to every emitted metric name.
///
/// The prefix has the shape `<app_prefix><app_name>.<hostname>`, with the
/// application name and hostname collapsed to single path nodes.  The
/// application prefix is taken literally: a trailing `.` in it is a
/// deliberate hierarchy separator.
pub fn graphite_prefix(app_prefix: &str, app_name: &str, hostname: &str) -> String {
    format!(
        "{}{}.{}",
        app_prefix,
        sanitize_path_node(app_name),
        sanitize_path_node(hostname)
    )
}

/// Sanitizes a metric name for the Graphite data model.
///
/// Dots are preserved, since they carry the metric hierarchy; anything
/// outside `[a-zA-Z0-9_.-]` is converted to an underscore.
pub fn sanitize_metric_name(name: &str) -> String {
    name.chars()
        .map(|c| if invalid_name_character(c) { '_' } else { c })
        .collect()
}

fn sanitize_tag(part: &str) -> String {
    part.chars()
        .map(|c| if invalid_tag_character(c) { '_' } else { c })
        .collect()
}

/// Splits a [`Key`] into a sanitized metric name and `key=value` tag pairs.
pub fn key_to_parts(key: &Key) -> (String, Vec<String>) {
    let name = sanitize_metric_name(key.name());
    let tags = key
        .labels()
        .map(|label| format!("{}={}", sanitize_tag(label.key()), sanitize_tag(label.value())))
        .collect();

    (name, tags)
}

pub fn write_plaintext_line<V>(
    buffer: &mut String,
    prefix: Option<&str>,
    name: &str,
    suffix: Option<&str>,
    tags: &[String],
    value: V,
    timestamp: u64,
) where
    V: std::fmt::Display,
{
    if let Some(prefix) = prefix {
        buffer.push_str(prefix);
        buffer.push('.');
    }
    buffer.push_str(name);

    if let Some(suffix) = suffix {
        buffer.push('.');
        buffer.push_str(suffix);
    }

    for tag in tags {
        buffer.push(';');
        buffer.push_str(tag);
    }

    buffer.push(' ');
    buffer.push_str(value.to_string().as_str());
    buffer.push(' ');
    buffer.push_str(timestamp.to_string().as_str());
    buffer.push('\n');
}

#[inline]
fn invalid_name_character(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[inline]
fn invalid_tag_character(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
}

#[cfg(test)]
mod tests {
    use super::{graphite_prefix, key_to_parts, sanitize_path_node, write_plaintext_line};
    use metrics::{Key, Label};

    #[test]
    fn prefix_without_dots_passes_through() {
        assert_eq!(graphite_prefix("svc.", "billing", "host01"), "svc.billing.host01");
        assert_eq!(graphite_prefix("", "billing", "host01"), "billing.host01");
    }

    #[test]
    fn prefix_collapses_dots_in_name_and_host() {
        assert_eq!(
            graphite_prefix("svc.", "billing.api", "host01.internal"),
            "svc.billing_api.host01_internal"
        );
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_path_node("a.b.c");
        let twice = sanitize_path_node(&once);
        assert_eq!(once, "a_b_c");
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_alters_only_dots() {
        assert_eq!(sanitize_path_node("west-2:eu/prod"), "west-2:eu/prod");
    }

    #[test]
    fn key_with_labels_becomes_tags() {
        let key = Key::from_parts("queue depth", vec![Label::new("shard", "a b")]);
        let (name, tags) = key_to_parts(&key);
        assert_eq!(name, "queue_depth");
        assert_eq!(tags, vec!["shard=a_b".to_string()]);
    }

    #[test]
    fn plaintext_line_layout() {
        let mut buffer = String::new();
        write_plaintext_line(
            &mut buffer,
            Some("svc.billing_api.host01_internal"),
            "queue.depth",
            None,
            &[],
            42.0,
            1_700_000_000,
        );
        assert_eq!(
            buffer,
            "svc.billing_api.host01_internal.queue.depth 42 1700000000\n"
        );
    }

    #[test]
    fn plaintext_line_with_suffix_and_tags() {
        let mut buffer = String::new();
        write_plaintext_line(
            &mut buffer,
            None,
            "request.latency",
            Some("mean"),
            &["route=checkout".to_string()],
            2.5,
            1000,
        );
        assert_eq!(buffer, "request.latency.mean;route=checkout 2.5 1000\n");
    }
}
