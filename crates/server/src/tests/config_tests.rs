use super::settings_from;

use shared::domain::{Mode, ParamName};

#[test]
fn missing_file_keeps_defaults() {
    let settings = settings_from(None).expect("settings");
    assert_eq!(settings.server_bind, "127.0.0.1:8000");
    assert_eq!(settings.schema.modes.len(), 4);
    assert_eq!(settings.schema.params[0].name, ParamName::from("foo"));
}

#[test]
fn file_overrides_bind_and_schema() {
    let settings = settings_from(Some(
        r#"
bind_addr = "0.0.0.0:9000"
modes = ["solid", "chase"]

[[params]]
name = "speed"
min = 1
max = 10
"#,
    ))
    .expect("settings");

    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(
        settings.schema.modes,
        vec![Mode::from("solid"), Mode::from("chase")]
    );
    assert_eq!(settings.schema.params.len(), 1);
    assert!(settings.schema.params[0].contains(10));
}

#[test]
fn rejects_inverted_parameter_range() {
    let err = settings_from(Some(
        r#"
[[params]]
name = "speed"
min = 10
max = 1
"#,
    ))
    .expect_err("inverted range");
    assert!(err.to_string().contains("speed"));
}

#[test]
fn rejects_empty_mode_list_and_unknown_keys() {
    assert!(settings_from(Some("modes = []")).is_err());
    assert!(settings_from(Some("database_url = \"sqlite::memory:\"")).is_err());
}
