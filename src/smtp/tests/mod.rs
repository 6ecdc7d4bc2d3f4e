mod email_parser_tests;
mod session_tests;
