//! The `phonebooks` XML format used by the device export and the local phonebook.

use super::{FonbookEntry, NumberType};
use crate::error::{FritzError, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::borrow::Cow;
use std::io::Cursor;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    Category,
    RealName,
    Number,
}

#[derive(Debug, Default)]
struct PendingNumber {
    kind: NumberType,
    quickdial: String,
    vanity: String,
    priority: u32,
    number: String,
}

fn text_or_raw(text: &BytesText<'_>) -> String {
    match text.unescape() {
        Ok(value) => value.into_owned(),
        // unknown entities such as &nbsp; are kept as they are
        Err(_) => String::from_utf8_lossy(&**text).into_owned(),
    }
}

fn number_attributes(element: &BytesStart<'_>) -> PendingNumber {
    let mut pending = PendingNumber::default();
    for attr in element.attributes().flatten() {
        let value: Cow<'_, str> = attr
            .unescape_value()
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned().into());
        match attr.key.as_ref() {
            b"type" => pending.kind = NumberType::from_name(&value),
            b"quickdial" => pending.quickdial = value.into_owned(),
            b"vanity" => pending.vanity = value.into_owned(),
            b"prio" => pending.priority = value.trim().parse().unwrap_or(0),
            _ => {}
        }
    }
    pending
}

/// Parse all `<contact>` elements of a phonebook document.
///
/// Contacts with `category` 1 are important. Numbers without digits are skipped.
/// Mismatched closing tags are tolerated. If the document breaks off, the
/// contacts read up to that point are returned; it is an error only when
/// there are none.
pub fn parse(xml: &str) -> Result<Vec<FonbookEntry>> {
    debug!("Parsing phonebook XML");
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    reader.config_mut().check_end_names = false;

    let mut entries = Vec::new();
    let mut current: Option<FonbookEntry> = None;
    let mut pending: Option<PendingNumber> = None;
    let mut field = Field::None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"contact" => {
                    // a contact left open ends where the next one starts
                    entries.extend(current.replace(FonbookEntry::new("", false)));
                }
                b"category" => field = Field::Category,
                b"realName" => field = Field::RealName,
                b"number" if current.is_some() => {
                    pending = Some(number_attributes(e));
                    field = Field::Number;
                }
                _ => field = Field::None,
            },
            Ok(Event::Text(ref e)) => {
                let text = text_or_raw(e);
                match (field, current.as_mut(), pending.as_mut()) {
                    (Field::Category, Some(entry), _) => entry.important = text.trim() == "1",
                    (Field::RealName, Some(entry), _) => entry.name.push_str(&text),
                    (Field::Number, _, Some(number)) => number.number.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                match e.name().as_ref() {
                    b"number" => {
                        if let (Some(entry), Some(number)) = (current.as_mut(), pending.take()) {
                            if !number.number.is_empty() {
                                let pos = entry.numbers.len();
                                entry.add_number(
                                    pos,
                                    number.number,
                                    number.kind,
                                    number.quickdial,
                                    number.vanity,
                                    number.priority,
                                );
                            }
                        }
                    }
                    b"contact" => entries.extend(current.take()),
                    _ => {}
                }
                field = Field::None;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                let message = format!(
                    "Phonebook XML error at position {}: {e}",
                    reader.buffer_position()
                );
                if entries.is_empty() && current.is_none() {
                    return Err(FritzError::parse(message));
                }
                warn!("{message}, keeping the contacts read so far");
                break;
            }
            _ => {}
        }
    }

    entries.extend(current.take());
    debug!("Parsed {} phonebook entries", entries.len());
    Ok(entries)
}

fn write(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| FritzError::parse(format!("Phonebook XML write error: {e}")))
}

fn write_text_element(writer: &mut Writer<Cursor<Vec<u8>>>, name: &str, text: &str) -> Result<()> {
    write(writer, Event::Start(BytesStart::new(name)))?;
    write(writer, Event::Text(BytesText::new(text)))?;
    write(writer, Event::End(BytesEnd::new(name)))
}

/// Serialize entries into a `phonebooks` document the device can import.
pub fn serialize(entries: &[FonbookEntry]) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write(&mut writer, Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    write(&mut writer, Event::Start(BytesStart::new("phonebooks")))?;
    write(&mut writer, Event::Start(BytesStart::new("phonebook")))?;

    for entry in entries {
        write(&mut writer, Event::Start(BytesStart::new("contact")))?;
        write_text_element(&mut writer, "category", if entry.important { "1" } else { "0" })?;
        write(&mut writer, Event::Start(BytesStart::new("person")))?;
        write_text_element(&mut writer, "realName", &entry.name)?;
        write(&mut writer, Event::End(BytesEnd::new("person")))?;

        write(&mut writer, Event::Start(BytesStart::new("telephony")))?;
        for number in entry.numbers.iter().filter(|n| !n.number.is_empty()) {
            let priority = number.priority.to_string();
            let mut element = BytesStart::new("number");
            element.push_attribute(("type", number.kind.xml_name()));
            element.push_attribute(("quickdial", number.quickdial.as_str()));
            element.push_attribute(("vanity", number.vanity.as_str()));
            element.push_attribute(("prio", priority.as_str()));
            write(&mut writer, Event::Start(element))?;
            write(&mut writer, Event::Text(BytesText::new(&number.number)))?;
            write(&mut writer, Event::End(BytesEnd::new("number")))?;
        }
        write(&mut writer, Event::End(BytesEnd::new("telephony")))?;
        write(&mut writer, Event::Empty(BytesStart::new("services")))?;
        write(&mut writer, Event::Empty(BytesStart::new("setup")))?;
        write(&mut writer, Event::End(BytesEnd::new("contact")))?;
    }

    write(&mut writer, Event::End(BytesEnd::new("phonebook")))?;
    write(&mut writer, Event::End(BytesEnd::new("phonebooks")))?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| FritzError::parse(format!("Phonebook XML is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<phonebooks>
<phonebook name="Telefonbuch">
<contact>
  <category>1</category>
  <person><realName>M&#252;ller &amp; S&#246;hne</realName></person>
  <telephony>
    <number type="work" quickdial="3" vanity="MUELLER" prio="1">0721123456</number>
    <number type="mobile" quickdial="" vanity="" prio="0">0171987654</number>
    <number type="home" prio="0"></number>
  </telephony>
  <services/>
  <setup/>
</contact>
<contact>
  <category>0</category>
  <person><realName>Oma</realName></person>
  <telephony><number type="home">089123</number></telephony>
</contact>
</phonebook>
</phonebooks>"#;

    #[test]
    fn test_parse_export() {
        let entries = parse(EXPORT).unwrap();
        assert_eq!(entries.len(), 2);

        let mueller = &entries[0];
        assert_eq!(mueller.name, "Müller & Söhne");
        assert!(mueller.important);
        assert_eq!(mueller.numbers.len(), 2);
        assert_eq!(mueller.numbers[0].number, "0721123456");
        assert_eq!(mueller.numbers[0].kind, NumberType::Work);
        assert_eq!(mueller.numbers[0].quickdial, "3");
        assert_eq!(mueller.numbers[0].vanity, "MUELLER");
        assert_eq!(mueller.numbers[0].priority, 1);
        assert_eq!(mueller.numbers[1].kind, NumberType::Mobile);

        let oma = &entries[1];
        assert!(!oma.important);
        assert_eq!(oma.numbers[0].number, "089123");
        assert_eq!(oma.numbers[0].kind, NumberType::Home);
    }

    #[test]
    fn test_parse_keeps_unknown_entities() {
        let xml = "<phonebooks><phonebook><contact><person><realName>A&nbsp;B</realName>\
                   </person></contact></phonebook></phonebooks>";
        let entries = parse(xml).unwrap();
        assert_eq!(entries[0].name, "A&nbsp;B");
    }

    #[test]
    fn test_parse_rejects_broken_xml() {
        assert!(parse("<phonebooks><contact").is_err());
    }

    #[test]
    fn test_parse_tolerates_mismatched_tags() {
        let xml = "<phonebooks><phonebook>\
                   <contact><person><realName>Anna</realName></person>\
                   <telephony><number type=\"home\">0721111</number></telephony></contact>\
                   <contact><person><realName>Bob</realname></person>\
                   <telephony><number type=\"mobile\">0171222</number></telephony></contact>\
                   </phonebook></phonebooks>";
        let entries = parse(xml).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Anna");
        assert_eq!(entries[1].name, "Bob");
        assert_eq!(entries[1].numbers[0].number, "0171222");
        assert_eq!(entries[1].numbers[0].kind, NumberType::Mobile);
    }

    #[test]
    fn test_parse_keeps_contacts_before_truncation() {
        let xml = "<phonebooks><phonebook>\
                   <contact><person><realName>Anna</realName></person>\
                   <telephony><number type=\"home\">0721111</number></telephony></contact>\
                   <contact><person><realName>Bob</realName></person><telephony><number";
        let entries = parse(xml).unwrap();
        assert_eq!(entries[0].name, "Anna");
        assert_eq!(entries[0].numbers[0].number, "0721111");
    }

    #[test]
    fn test_serialize_escapes_and_types() {
        let mut entry = FonbookEntry::new("Tom & Jerry", true);
        entry.add_number(0, "0721", NumberType::None, "12", "", 1);
        entry.add_number(2, "0171", NumberType::Mobile, "", "", 0);
        let xml = serialize(&[entry]).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?><phonebooks><phonebook><contact>"));
        assert!(xml.contains("<category>1</category>"));
        assert!(xml.contains("<realName>Tom &amp; Jerry</realName>"));
        assert!(xml.contains(
            r#"<number type="home" quickdial="12" vanity="" prio="1">0721</number>"#
        ));
        assert!(xml.contains(r#"<number type="mobile" quickdial="" vanity="" prio="0">0171</number>"#));
        assert_eq!(xml.matches("<number").count(), 2);
        assert!(xml.contains("<services/><setup/></contact>"));
    }

    #[test]
    fn test_serialized_document_parses() {
        let entries = parse(EXPORT).unwrap();
        let reparsed = parse(&serialize(&entries).unwrap()).unwrap();
        assert_eq!(reparsed[0].name, "Müller & Söhne");
        assert_eq!(reparsed[0].numbers[0].vanity, "MUELLER");
        assert_eq!(reparsed[1].numbers[0].number, "089123");
    }
}
