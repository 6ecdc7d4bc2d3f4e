use crate::message::Header;
use crate::smtp::email_parser::EmailParser;

#[test]
fn parses_simple_email() {
    let email = "From: sender@example.com\r\n\
                 To: recipient@example.com\r\n\
                 Subject: Test Email\r\n\
                 \r\n\
                 This is a test email.\r\n\
                 It has multiple lines.\r\n";

    let parsed = EmailParser::parse(email);
    assert_eq!(parsed.subject, "Test Email");
    assert_eq!(parsed.body, "This is a test email.\r\nIt has multiple lines.\r\n");
    assert_eq!(parsed.headers.len(), 3);
    assert_eq!(parsed.headers[0].key, "From");
    assert_eq!(parsed.headers[2].value, "Test Email");
}

#[test]
fn preserves_header_order_and_duplicates() {
    let email = "Received: by relay-b\r\n\
                 From: sender@example.com\r\n\
                 Received: by relay-a\r\n\
                 \r\n\
                 body\r\n";

    let parsed = EmailParser::parse(email);
    assert_eq!(
        parsed.headers,
        vec![
            Header {
                key: "Received".to_string(),
                value: "by relay-b".to_string()
            },
            Header {
                key: "From".to_string(),
                value: "sender@example.com".to_string()
            },
            Header {
                key: "Received".to_string(),
                value: "by relay-a".to_string()
            },
        ]
    );
}

#[test]
fn folds_continuation_lines_into_previous_value() {
    let email = "Subject: a rather long\r\n\
                 \tfolded subject line\r\n\
                 X-Other: value\r\n\
                 \r\n\
                 body\r\n";

    let parsed = EmailParser::parse(email);
    assert_eq!(parsed.subject, "a rather long folded subject line");
    assert_eq!(parsed.headers[1].key, "X-Other");
}

#[test]
fn subject_lookup_is_case_insensitive() {
    let email = "SUBJECT: shouted\r\n\r\nbody\r\n";
    let parsed = EmailParser::parse(email);
    assert_eq!(parsed.subject, "shouted");
}

#[test]
fn missing_subject_yields_empty_string() {
    let email = "From: sender@example.com\r\n\r\nBody only.\r\n";
    let parsed = EmailParser::parse(email);
    assert!(parsed.subject.is_empty());
    assert_eq!(parsed.body, "Body only.\r\n");
}

#[test]
fn empty_body_after_headers() {
    let email = "Subject: Empty Body Test\r\n\r\n";
    let parsed = EmailParser::parse(email);
    assert_eq!(parsed.subject, "Empty Body Test");
    assert!(parsed.body.is_empty());
}

#[test]
fn accepts_bare_lf_line_endings() {
    let email = "Subject: unix\nFrom: a@b\n\nplain body\n";
    let parsed = EmailParser::parse(email);
    assert_eq!(parsed.subject, "unix");
    assert_eq!(parsed.body, "plain body\n");
}

#[test]
fn malformed_header_falls_back_to_raw_body() {
    let email = "this line has no colon\r\n\r\nrest\r\n";
    let parsed = EmailParser::parse(email);
    assert!(parsed.subject.is_empty());
    assert!(parsed.headers.is_empty());
    assert_eq!(parsed.body, email);
}

#[test]
fn continuation_without_header_falls_back_to_raw_body() {
    let email = " leading continuation\r\n\r\nrest\r\n";
    let parsed = EmailParser::parse(email);
    assert!(parsed.headers.is_empty());
    assert_eq!(parsed.body, email);
}

#[test]
fn missing_separator_falls_back_to_raw_body() {
    let email = "Subject: no separator\r\nFrom: a@b\r\n";
    let parsed = EmailParser::parse(email);
    assert!(parsed.headers.is_empty());
    assert!(parsed.subject.is_empty());
    assert_eq!(parsed.body, email);
}

#[test]
fn payload_starting_with_blank_line_is_all_body() {
    let email = "\r\njust a body\r\n";
    let parsed = EmailParser::parse(email);
    assert!(parsed.headers.is_empty());
    assert_eq!(parsed.body, "just a body\r\n");
}
