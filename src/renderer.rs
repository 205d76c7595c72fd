//! Per-recipient message rendering.
//!
//! Step templates use `{{placeholder}}` merge fields. Rendering is total: every
//! `{{identifier}}` token is replaced (unknown or empty fields become ""), and
//! substituted values are never re-scanned.

use crate::types::{Recipient, Step};

const FOOTER_PREAMBLE: &str = "If you no longer wish to receive these emails, unsubscribe here:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub text: String,
    pub html: String,
    pub unsubscribe_url: String,
}

/// Merge-field values resolved for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeFields<'a> {
    pub first_name: String,
    pub last_name: String,
    pub company: &'a str,
    pub email: &'a str,
}

impl<'a> MergeFields<'a> {
    pub fn for_recipient(recipient: &'a Recipient) -> Self {
        let mut name_tokens = recipient
            .name
            .as_deref()
            .unwrap_or("")
            .split_whitespace();
        let name_first = name_tokens.next();
        let name_rest = name_tokens.collect::<Vec<_>>().join(" ");

        let first_name = non_blank(recipient.first_name.as_deref())
            .or(name_first)
            .unwrap_or_else(|| local_part(&recipient.email))
            .to_string();
        let last_name = non_blank(recipient.last_name.as_deref())
            .map(str::to_string)
            .unwrap_or(name_rest);

        Self {
            first_name,
            last_name,
            company: recipient.company.as_deref().unwrap_or(""),
            email: &recipient.email,
        }
    }

    fn get(&self, key: &str) -> &str {
        match key {
            "first_name" => &self.first_name,
            "last_name" => &self.last_name,
            "company" => self.company,
            "email" => self.email,
            _ => "",
        }
    }
}

/// Compliance link resolved by the opt-out endpoint without any lookup table.
pub fn unsubscribe_url(base_url: &str, email: &str, tenant_id: &str) -> String {
    format!(
        "{}/api/unsubscribe?email={}&uid={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(email),
        urlencoding::encode(tenant_id)
    )
}

pub fn render(
    step: &Step,
    recipient: &Recipient,
    tenant_id: &str,
    base_url: &str,
) -> RenderedMessage {
    let fields = MergeFields::for_recipient(recipient);
    let unsubscribe_url = unsubscribe_url(base_url, &recipient.email, tenant_id);

    let subject = substitute(&step.subject, &fields, false);

    let text = format!(
        "{}\n\n---\n{} {}",
        substitute(&strip_tags(&step.body), &fields, false),
        FOOTER_PREAMBLE,
        unsubscribe_url
    );

    let escaped_url = escape_html(&unsubscribe_url);
    let html_source = format!(
        "{}\n\n---\n{} <a href=\"{}\">{}</a>",
        substitute(&step.body, &fields, true),
        FOOTER_PREAMBLE,
        escaped_url,
        escaped_url
    );
    let html = html_source.replace("\r\n", "\n").replace('\n', "<br>");

    RenderedMessage {
        subject,
        text,
        html,
        unsubscribe_url,
    }
}

/// Single-pass `{{name}}` substitution.
pub(crate) fn substitute(template: &str, fields: &MergeFields<'_>, escape: bool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let key = after.find("}}").map(|end| (after[..end].trim(), end));

        match key {
            Some((key, end)) if is_identifier(key) => {
                let value = fields.get(key);
                if escape {
                    out.push_str(&escape_html(value));
                } else {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            // Not a placeholder here; emit one brace and rescan so "{{{x}}}"
            // and "{{ {{x}}" still resolve the inner token.
            _ => {
                out.push('{');
                rest = &rest[start + 1..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// Remove `<...>` markup, mirroring a `<[^>]+>` replace.
pub(crate) fn strip_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('>') {
            Some(close) if close > 0 => rest = &after[close + 1..],
            _ => {
                out.push('<');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn is_identifier(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn local_part(email: &str) -> &str {
    email.split('@').next().unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://app.example.com";

    fn recipient(email: &str) -> Recipient {
        Recipient::new("r1", email)
    }

    fn step(subject: &str, body: &str) -> Step {
        Step::new(subject, body, 0)
    }

    #[test]
    fn first_name_falls_back_to_email_local_part() {
        let r = recipient("jane@co.com");
        let msg = render(&step("Hi {{first_name}}", ""), &r, "t1", BASE);
        assert_eq!(msg.subject, "Hi jane");
    }

    #[test]
    fn combined_name_is_split_into_first_and_last() {
        let mut r = recipient("x@co.com");
        r.name = Some("  Ada   King Lovelace ".to_string());
        let fields = MergeFields::for_recipient(&r);
        assert_eq!(fields.first_name, "Ada");
        assert_eq!(fields.last_name, "King Lovelace");
    }

    #[test]
    fn discrete_name_fields_win_over_combined_name() {
        let mut r = recipient("x@co.com");
        r.first_name = Some("Grace".to_string());
        r.last_name = Some("Hopper".to_string());
        r.name = Some("Someone Else".to_string());
        let fields = MergeFields::for_recipient(&r);
        assert_eq!(fields.first_name, "Grace");
        assert_eq!(fields.last_name, "Hopper");
    }

    #[test]
    fn all_occurrences_are_replaced() {
        let mut r = recipient("bob@acme.io");
        r.company = Some("Acme".to_string());
        let msg = render(
            &step("{{company}} / {{company}}", "{{email}} at {{ company }}"),
            &r,
            "t1",
            BASE,
        );
        assert_eq!(msg.subject, "Acme / Acme");
        assert!(msg.text.starts_with("bob@acme.io at Acme"));
    }

    #[test]
    fn missing_and_unknown_fields_render_empty() {
        let r = recipient("bob@acme.io");
        let msg = render(&step("[{{company}}][{{last_name}}][{{nope}}]", ""), &r, "t1", BASE);
        assert_eq!(msg.subject, "[][][]");
    }

    #[test]
    fn no_recognized_token_survives_rendering() {
        let r = Recipient::new("r1", "");
        let templates = [
            "{{first_name}}{{last_name}}{{company}}{{email}}",
            "{{{first_name}}}",
            "{{ {{email}}",
            "{{first_name",
            "}}{{company}}{{",
        ];
        for template in templates {
            let msg = render(&step(template, template), &r, "t1", BASE);
            for token in ["{{first_name}}", "{{last_name}}", "{{company}}", "{{email}}"] {
                assert!(!msg.subject.contains(token), "{template}: {}", msg.subject);
                assert!(!msg.text.contains(token), "{template}: {}", msg.text);
                assert!(!msg.html.contains(token), "{template}: {}", msg.html);
            }
        }
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let mut r = recipient("a@b.com");
        r.company = Some("{{email}}".to_string());
        let msg = render(&step("{{company}}", ""), &r, "t1", BASE);
        assert_eq!(msg.subject, "{{email}}");
    }

    #[test]
    fn html_variant_converts_line_breaks_and_escapes_values() {
        let mut r = recipient("a@b.com");
        r.company = Some("<Acme & Co>".to_string());
        let msg = render(&step("s", "Line one\nAt {{company}}"), &r, "t1", BASE);
        assert!(msg.html.starts_with("Line one<br>At &lt;Acme &amp; Co&gt;"));
        assert!(!msg.html.contains('\n'));
    }

    #[test]
    fn text_variant_strips_markup() {
        let r = recipient("a@b.com");
        let msg = render(&step("s", "<p>Hello <b>{{first_name}}</b></p>"), &r, "t1", BASE);
        assert!(msg.text.starts_with("Hello a"));
        assert!(!msg.text.contains("<b>"));
    }

    #[test]
    fn both_variants_carry_the_same_unsubscribe_link() {
        let r = recipient("Jane+x@Co.com");
        let msg = render(&step("s", "body"), &r, "tenant 1", BASE);
        assert_eq!(
            msg.unsubscribe_url,
            "https://app.example.com/api/unsubscribe?email=Jane%2Bx%40Co.com&uid=tenant%201"
        );
        assert!(msg.text.contains(&msg.unsubscribe_url));
        assert!(msg.html.contains(&msg.unsubscribe_url.replace('&', "&amp;")));
        assert!(msg.text.contains(FOOTER_PREAMBLE));
        assert!(msg.html.contains(FOOTER_PREAMBLE));
    }

    #[test]
    fn html_footer_is_the_text_footer_with_a_link() {
        let r = recipient("a@b.com");
        let msg = render(&step("s", "body"), &r, "t1", BASE);

        let text_footer = msg.text.split("---\n").nth(1).unwrap();
        let html_footer = msg.html.split("---<br>").nth(1).unwrap();

        assert_eq!(strip_tags(html_footer).replace("&amp;", "&"), text_footer);
        assert!(html_footer.contains("<a href="));
    }

    #[test]
    fn strip_tags_keeps_lone_angle_brackets() {
        assert_eq!(strip_tags("a <> b < c"), "a <> b < c");
        assert_eq!(strip_tags("<a href=\"x\">link</a>"), "link");
    }
}
