//! Phone number helpers and parsers for the device settings pages.

use std::cmp::Ordering;
use tracing::{debug, error};

const LKZ_TAG: &str = "telcfg:settings/Location/LKZ";
const OKZ_TAG: &str = "telcfg:settings/Location/OKZ";
const SIP_LIST_PAGENAME: &str = "<!-- pagename:/fon_num/fon_num_list.lua-->";
const MAX_SIP_PROVIDERS: usize = 10;

/// Whether `number` is one of the local numbers in `filter`.
///
/// An empty filter lets every number pass. Matching is by suffix, so a local
/// number with area code still matches an MSN configured without it.
pub fn matches_msn_filter(number: &str, filter: &[String]) -> bool {
    filter.is_empty() || filter.iter().any(|msn| number.ends_with(msn.as_str()))
}

/// Bring a number into the form `00<country><area><number>`.
pub fn normalize_number(number: &str, country_code: &str, region_code: &str) -> String {
    let mut number = number;

    // *xyz# control codes of the device
    if number.starts_with('*') {
        if let Some(hash) = number.find('#') {
            number = &number[hash + 1..];
        }
    }

    // German call-by-call prefixes 010xx and 0100xx
    if country_code == "49" && number.starts_with("010") {
        let skip = if number.starts_with("0100") { 6 } else { 5 };
        number = number.get(skip..).unwrap_or("");
    }

    if let Some(rest) = number.strip_prefix('+') {
        format!("00{rest}")
    } else if number.starts_with("00") {
        number.to_string()
    } else if let Some(rest) = number.strip_prefix('0') {
        format!("00{country_code}{rest}")
    } else {
        format!("00{country_code}{region_code}{number}")
    }
}

/// Compare two numbers after normalization.
pub fn compare_normalized(a: &str, b: &str, country_code: &str, region_code: &str) -> Ordering {
    normalize_number(a, country_code, region_code)
        .cmp(&normalize_number(b, country_code, region_code))
}

/// The `pos`-th field of `buffer`, or an empty string if there are fewer fields.
///
/// Each search for the next delimiter starts one character past the previous
/// one, so a delimiter at the very start of `buffer` only ends field 0.
/// `";a;b"` yields `""` for field 0 and `"b"` for field 1.
pub fn tokenize(buffer: &str, delimiter: char, pos: usize) -> String {
    let mut start = 0;
    for _ in 0..pos {
        let from = start + buffer[start..].chars().next().map_or(1, char::len_utf8);
        match buffer.get(from..).and_then(|rest| rest.find(delimiter)) {
            Some(offset) => start = from + offset,
            None => return String::new(),
        }
    }
    if start > 0 {
        start += delimiter.len_utf8();
    }
    buffer[start..]
        .split(delimiter)
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Text between the first pair of double quotes at or after `from`.
fn quoted_from(html: &str, from: usize) -> Option<&str> {
    let rest = html.get(from..)?;
    let start = rest.find('"')? + 1;
    let len = rest[start..].find('"')?;
    Some(&rest[start..start + len])
}

/// Value assigned to a settings key, skipping the quote that closes the key.
fn setting_value<'a>(html: &'a str, tag: &str) -> Option<&'a str> {
    let pos = html.find(tag)?;
    quoted_from(html, pos + tag.len() + 1)
}

/// Country (LKZ) and area code (OKZ) from the phone settings page.
pub fn parse_location_settings(html: &str) -> Option<(String, String)> {
    let Some(lkz) = setting_value(html, LKZ_TAG) else {
        error!("Could not find LKZ in location settings, resolving numbers may not always work");
        return None;
    };
    let Some(okz) = setting_value(html, OKZ_TAG) else {
        error!("Could not find OKZ in location settings, resolving numbers may not always work");
        return None;
    };
    Some((lkz.to_string(), okz.to_string()))
}

/// Provider names and MSNs of the configured SIP accounts.
///
/// Understands the lua number list and the older `siplist` page. On the lua
/// page every slot up to ten is reported, unused ones as empty strings.
pub fn parse_sip_settings(html: &str) -> Option<(Vec<String>, Vec<String>)> {
    if html.contains(SIP_LIST_PAGENAME) {
        return Some(parse_sip_settings_lua(html));
    }
    if !html.contains("function AuswahlDisplay") {
        error!("Could not find SIP list, provider names are not available");
        return None;
    }
    let parsed = parse_sip_settings_legacy(html);
    if parsed.is_none() {
        error!("Could not parse SIP provider names, provider names are not available");
    }
    parsed
}

fn parse_sip_settings_lua(html: &str) -> (Vec<String>, Vec<String>) {
    let mut names = Vec::with_capacity(MAX_SIP_PROVIDERS);
    let mut msns = Vec::with_capacity(MAX_SIP_PROVIDERS);
    for i in 0..MAX_SIP_PROVIDERS {
        let msn_tag = format!("telcfg:settings/SIP{i}/MSN");
        let name_tag = format!("telcfg:settings/SIP{i}/Name");
        let Some(msn) = setting_value(html, &msn_tag) else {
            names.push(String::new());
            msns.push(String::new());
            continue;
        };
        let name = setting_value(html, &name_tag).unwrap_or_default();
        debug!("Found SIP{i} provider name {name}");
        names.push(name.to_string());
        msns.push(msn.to_string());
    }
    (names, msns)
}

fn parse_sip_settings_legacy(html: &str) -> Option<(Vec<String>, Vec<String>)> {
    const ENTRY: &str = "AuswahlDisplay(\"";
    const MSN_CELL: &str = "<td class=\"c2\">";
    const PROVIDER: &str = "ProviderDisplay(\"";

    let table = provider_table(html)?;
    let mut names = Vec::new();
    let mut msns = Vec::new();
    let mut search_from = 1;

    for _ in 0..MAX_SIP_PROVIDERS {
        let Some(offset) = html.get(search_from..).and_then(|rest| rest.find(ENTRY)) else {
            break;
        };
        let entry = search_from + offset;
        search_from = entry + 1;

        let before = &html[..entry];
        let msn_start = before.rfind(MSN_CELL)? + MSN_CELL.len();
        let msn_len = html[msn_start..].find("</td>")?;
        let msn = &html[msn_start..msn_start + msn_len];

        let host_start = before.rfind(PROVIDER)? + PROVIDER.len();
        let host_len = html[host_start..].find('"')?;
        let host = &html[host_start..host_start + host_len];

        let name = table
            .iter()
            .find(|(table_host, _)| host.contains(table_host.as_str()))
            .map(|(_, name)| name.as_str())
            .unwrap_or(host);
        debug!("Found SIP provider {host} named {name}");
        names.push(name.to_string());
        msns.push(msn.to_string());
    }
    Some((names, msns))
}

/// The `case "<host>": return "<name>"` table of the page's ProviderDisplay function.
fn provider_table(html: &str) -> Option<Vec<(String, String)>> {
    let start = html.find("function ProviderDisplay")?;
    let body = &html[start..];
    let body = &body[..body.find('}')?];
    let mut entries = Vec::new();
    let mut rest = body;
    while let Some(case) = rest.find("case \"") {
        let after = &rest[case + 6..];
        let host_len = after.find('"')?;
        let host = &after[..host_len];
        let after = &after[host_len..];
        let ret = after.find("return \"")? + 8;
        let name_len = after[ret..].find('"')?;
        entries.push((host.to_string(), after[ret..ret + name_len].to_string()));
        rest = &after[ret + name_len..];
    }
    if entries.is_empty() {
        return None;
    }
    Some(entries)
}

/// Provider name for a call monitor medium like `SIP0`.
pub fn sip_medium_name(medium: &str, sip_names: &[String]) -> String {
    medium
        .strip_prefix("SIP")
        .and_then(|index| {
            let digits: String = index.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<usize>().ok()
        })
        .and_then(|index| sip_names.get(index))
        .filter(|name| !name.is_empty())
        .cloned()
        .unwrap_or_else(|| medium.to_string())
}

/// Percent-encode the Latin-1 form of `s`, keeping only ASCII alphanumerics.
pub fn url_encode_latin1(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for c in s.chars() {
        let byte = u8::try_from(u32::from(c)).unwrap_or(b'?');
        if byte.is_ascii_alphanumeric() {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02x}"));
        }
    }
    out
}

/// Decode the HTML entities found in the device's legacy pages.
///
/// Unknown entities are kept as they are.
pub fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let decoded = candidate.find(';').and_then(|end| {
            let entity = &candidate[1..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some(' '),
                "auml" => Some('ä'),
                "ouml" => Some('ö'),
                "uuml" => Some('ü'),
                "Auml" => Some('Ä'),
                "Ouml" => Some('Ö'),
                "Uuml" => Some('Ü'),
                "szlig" => Some('ß'),
                _ => entity
                    .strip_prefix("#x")
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(msns: &[&str]) -> Vec<String> {
        msns.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_msn_filter_matches_all() {
        assert!(matches_msn_filter("12345", &[]));
        assert!(matches_msn_filter("", &[]));
    }

    #[test]
    fn test_msn_filter_suffix_match() {
        let msns = filter(&["0815", "072514444"]);
        assert!(matches_msn_filter("0815", &msns));
        assert!(matches_msn_filter("072514444", &msns));
        assert!(matches_msn_filter("072510815", &msns));

        assert!(!matches_msn_filter("08151", &msns));
        assert!(!matches_msn_filter("4444", &msns));
        assert!(!matches_msn_filter("07251", &msns));
        assert!(!matches_msn_filter("99", &msns));
    }

    #[test]
    fn test_normalize_local_and_national() {
        assert_eq!(normalize_number("4711", "49", "7251"), "004972514711");
        assert_eq!(normalize_number("072514711", "49", "7251"), "004972514711");
    }

    #[test]
    fn test_normalize_international() {
        assert_eq!(normalize_number("+4989123", "49", "7251"), "004989123");
        assert_eq!(normalize_number("0041441234567", "49", "7251"), "0041441234567");
    }

    #[test]
    fn test_normalize_strips_control_code() {
        assert_eq!(normalize_number("*31#0721555", "49", "7251"), "0049721555");
    }

    #[test]
    fn test_normalize_strips_call_by_call() {
        assert_eq!(normalize_number("01013089123", "49", "7251"), "004989123");
        assert_eq!(normalize_number("010012089123", "49", "7251"), "004989123");
        // only in Germany
        assert_eq!(normalize_number("01013089123", "43", "1"), "00431013089123");
    }

    #[test]
    fn test_compare_normalized() {
        assert_eq!(compare_normalized("69695", "0725169695", "49", "7251"), Ordering::Equal);
        assert_ne!(compare_normalized("69695", "49725169695", "49", "7251"), Ordering::Equal);
        assert_ne!(compare_normalized("69695", "072569695", "49", "7251"), Ordering::Equal);
    }

    #[test]
    fn test_tokenize() {
        let buffer = "(Bla, Blubb, Dings, Bumms)";
        assert_eq!(tokenize(buffer, ',', 0), "(Bla");
        assert_eq!(tokenize(buffer, ',', 1), " Blubb");
        assert_eq!(tokenize(buffer, ',', 2), " Dings");
        assert_eq!(tokenize(buffer, ',', 3), " Bumms)");
        assert_eq!(tokenize(buffer, ',', 4), "");
    }

    #[test]
    fn test_tokenize_empty_fields() {
        let line = "01.01.10 12:00:00;DISCONNECT;1;0;;";
        assert_eq!(tokenize(line, ';', 3), "0");
        assert_eq!(tokenize(line, ';', 4), "");
        assert_eq!(tokenize(line, ';', 9), "");
    }

    #[test]
    fn test_tokenize_leading_delimiter() {
        assert_eq!(tokenize(";a;b", ';', 0), "");
        assert_eq!(tokenize(";a;b", ';', 1), "b");
        assert_eq!(tokenize(";a;b", ';', 2), "");
        assert_eq!(tokenize("", ';', 1), "");
        assert_eq!(tokenize("ä;ö;ü", ';', 2), "ü");
    }

    #[test]
    fn test_parse_location_lua() {
        let html = r#"<!-- pagename:/fon_num/sip_option.lua-->
            ["telcfg:settings/Location/LKZ"] = "49",
            ["telcfg:settings/Location/OKZ"] = "7251","#;
        assert_eq!(
            parse_location_settings(html),
            Some(("49".to_string(), "7251".to_string()))
        );
    }

    #[test]
    fn test_parse_location_missing() {
        assert_eq!(parse_location_settings("<html></html>"), None);
        assert_eq!(
            parse_location_settings(r#"["telcfg:settings/Location/LKZ"] = "49","#),
            None
        );
    }

    #[test]
    fn test_parse_sip_lua() {
        let html = r#"<!-- pagename:/fon_num/fon_num_list.lua-->
            ["telcfg:settings/SIP0/MSN"] = "4711",
            ["telcfg:settings/SIP0/Name"] = "sipgate",
            ["telcfg:settings/SIP2/MSN"] = "4712",
            ["telcfg:settings/SIP2/Name"] = "1und1","#;
        let (names, msns) = parse_sip_settings(html).unwrap();
        assert_eq!(names.len(), 10);
        assert_eq!(names[0], "sipgate");
        assert_eq!(msns[0], "4711");
        assert_eq!(names[1], "");
        assert_eq!(names[2], "1und1");
        assert_eq!(msns[2], "4712");
    }

    #[test]
    fn test_parse_sip_legacy() {
        let html = r#"
            function ProviderDisplay(p) {
              switch (p) {
                case "sipgate.de": return "sipgate";
                case "1und1.de": return "1&1";
              }
            function AuswahlDisplay(n) { }
            <tr><td class="c1">ProviderDisplay("sipgate.de")</td><td class="c2">4711</td>
            <td>AuswahlDisplay("0")</td></tr>
            <tr><td class="c1">ProviderDisplay("sip.example.org")</td><td class="c2">4712</td>
            <td>AuswahlDisplay("1")</td></tr>"#;
        let (names, msns) = parse_sip_settings(html).unwrap();
        assert_eq!(names, vec!["sipgate".to_string(), "sip.example.org".to_string()]);
        assert_eq!(msns, vec!["4711".to_string(), "4712".to_string()]);
    }

    #[test]
    fn test_parse_sip_unknown_page() {
        assert!(parse_sip_settings("<html>nothing here</html>").is_none());
    }

    #[test]
    fn test_sip_medium_name() {
        let names = filter(&["sipgate", "", "1und1"]);
        assert_eq!(sip_medium_name("SIP0", &names), "sipgate");
        assert_eq!(sip_medium_name("SIP2", &names), "1und1");
        assert_eq!(sip_medium_name("SIP1", &names), "SIP1");
        assert_eq!(sip_medium_name("SIP7", &names), "SIP7");
        assert_eq!(sip_medium_name("POTS", &names), "POTS");
        assert_eq!(sip_medium_name("ISDN", &names), "ISDN");
    }

    #[test]
    fn test_url_encode_latin1() {
        assert_eq!(url_encode_latin1("abcXYZ019"), "abcXYZ019");
        assert_eq!(url_encode_latin1("a b&c"), "a%20b%26c");
        assert_eq!(url_encode_latin1("ä"), "%e4");
        assert_eq!(url_encode_latin1("€"), "%3f");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("M&uuml;ller &amp; S&#246;hne"), "Müller & Söhne");
        assert_eq!(decode_entities("A&#x41;&nbsp;B"), "AA B");
        assert_eq!(decode_entities("Tom & Jerry &bogus; &"), "Tom & Jerry &bogus; &");
    }
}
