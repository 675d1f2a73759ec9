//! HTML rendering.

use std::fmt::Write;

use super::flash::Flash;

/// Escapes text for use in element content and quoted attributes.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Wraps `content` (already HTML) in the site layout.
pub fn page(title: &str, flash: Option<&Flash>, content: &str) -> String {
    let mut html = String::new();
    let _ = write!(
        html,
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{} | Meadowlark Travel</title>\n</head>\n<body>\n",
        escape(title),
    );
    html.push_str("<header><a href=\"/\">Meadowlark Travel</a></header>\n");
    if let Some(flash) = flash {
        let _ = writeln!(
            html,
            "<div class=\"alert alert-{}\"><strong>{}</strong> {}</div>",
            flash.kind,
            escape(&flash.intro),
            escape(&flash.message),
        );
    }
    html.push_str(content);
    html.push_str("\n</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::flash::FlashKind;

    #[test]
    fn escapes_markup() {
        assert_eq!(escape(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn layout_renders_the_flash() {
        let flash = Flash::new(FlashKind::Danger, "Validation error!", "<bad>");
        let html = page("Home", Some(&flash), "<h1>Welcome</h1>");
        assert!(html.contains("<title>Home | Meadowlark Travel</title>"));
        assert!(html.contains("alert-danger"));
        assert!(html.contains("&lt;bad&gt;"));
        assert!(html.contains("<h1>Welcome</h1>"));
    }
}
