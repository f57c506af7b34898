//! Rewrites the on-disk discovery document's `action` elements with the
//! server's own advertised URL, leaving every other attribute untouched.

use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

use crate::error::AppError;

/// Rewrite every `<action ... urlsrc="...">` attribute in `xml` to
/// `<advertised_url>/loleaflet/dist/loleaflet.html?`, leaving every other
/// element and attribute byte-for-byte unchanged.
pub fn rewrite(xml: &str, advertised_url: &str) -> Result<String, AppError> {
    let new_urlsrc = format!("{advertised_url}/loleaflet/dist/loleaflet.html?");

    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());

    loop {
        match reader.read_event().map_err(|e| AppError::Other(e.into()))? {
            Event::Eof => break,
            Event::Start(e) if e.name().as_ref() == b"action" => {
                writer
                    .write_event(Event::Start(rewrite_urlsrc(&e, &new_urlsrc)))
                    .map_err(|e| AppError::Other(e.into()))?;
            }
            Event::Empty(e) if e.name().as_ref() == b"action" => {
                writer
                    .write_event(Event::Empty(rewrite_urlsrc(&e, &new_urlsrc)))
                    .map_err(|e| AppError::Other(e.into()))?;
            }
            other => {
                writer.write_event(other).map_err(|e| AppError::Other(e.into()))?;
            }
        }
    }

    String::from_utf8(writer.into_inner()).map_err(|e| AppError::Other(e.into()))
}

fn rewrite_urlsrc<'a>(start: &BytesStart<'a>, new_urlsrc: &str) -> BytesStart<'a> {
    let mut out = BytesStart::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes().flatten() {
        if attr.key.as_ref() == b"urlsrc" {
            out.push_attribute(("urlsrc", new_urlsrc));
        } else {
            out.push_attribute(attr);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_every_action_urlsrc_and_nothing_else() {
        let xml = r#"<wopi-discovery>
  <net-zone name="external-http">
    <app name="writer">
      <action ext="odt" name="edit" urlsrc=""/>
    </app>
    <app name="calc">
      <action ext="ods" name="edit" urlsrc=""/>
    </app>
    <app name="impress">
      <action ext="odp" name="edit" urlsrc=""/>
    </app>
  </net-zone>
</wopi-discovery>"#;

        let rewritten = rewrite(xml, "https://host:9980").unwrap();
        let expected_src = r#"urlsrc="https://host:9980/loleaflet/dist/loleaflet.html?""#;
        assert_eq!(rewritten.matches(expected_src).count(), 3);
        assert!(rewritten.contains(r#"ext="odt""#));
        assert!(rewritten.contains(r#"ext="ods""#));
        assert!(rewritten.contains(r#"ext="odp""#));
    }

    #[test]
    fn is_idempotent_under_repeated_rewrite() {
        let xml = r#"<d><action name="a" urlsrc=""/></d>"#;
        let once = rewrite(xml, "https://h:1").unwrap();
        let twice = rewrite(&once, "https://h:1").unwrap();
        assert_eq!(once, twice);
    }
}
