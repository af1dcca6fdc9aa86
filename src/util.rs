//
// Env methods
//
use std::env;
use std::fs;
use std::str::FromStr;
use std::thread::sleep;
use std::time::Duration;

use log::warn;

pub fn get_env_str_value(key: &str) -> Option<String> {
    let key_file = format!("{key}_FILE");
    let value_from_env = env::var(key);
    let value_file = env::var(&key_file);

    match (value_from_env, value_file) {
        (Ok(_), Ok(_)) => panic!("You should not define both {key} and {key_file}!"),
        (Ok(v_env), Err(_)) => Some(v_env),
        (Err(_), Ok(v_file)) => match fs::read_to_string(v_file) {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) => panic!("Failed to load {key}: {e:?}"),
        },
        _ => None,
    }
}

pub fn try_parse_string<S, T>(string: Option<S>) -> Option<T>
where
    S: AsRef<str>,
    T: FromStr,
{
    if let Some(Ok(value)) = string.map(|s| s.as_ref().parse::<T>()) {
        Some(value)
    } else {
        None
    }
}

pub fn get_env<V>(key: &str) -> Option<V>
where
    V: FromStr,
{
    try_parse_string(get_env_str_value(key))
}

pub fn get_env_bool(key: &str) -> Option<bool> {
    const TRUE_VALUES: &[&str] = &["true", "t", "yes", "y", "1"];
    const FALSE_VALUES: &[&str] = &["false", "f", "no", "n", "0"];

    match get_env_str_value(key) {
        Some(val) if TRUE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(true),
        Some(val) if FALSE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(false),
        _ => None,
    }
}

//
// Identifiers
//

pub fn get_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

//
// Retry methods
//

/// Retries a fallible operation up to `max_tries` times, with a 500ms backoff between
/// attempts. `max_tries == 0` means retry indefinitely.
pub fn retry<F, T, E>(func: F, max_tries: u32) -> Result<T, E>
where
    F: Fn() -> Result<T, E>,
    E: std::fmt::Debug,
{
    let mut tries = 0;

    loop {
        match func() {
            ok @ Ok(_) => return ok,
            Err(e) => {
                tries += 1;

                if max_tries > 0 && tries >= max_tries {
                    return Err(e);
                }

                warn!("Operation failed, retrying ({tries}/{max_tries}): {e:?}");
                sleep(Duration::from_millis(500));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_parses_truthy_and_falsy_tokens() {
        std::env::set_var("DBFLEET_TEST_BOOL_TRUE", "Yes");
        std::env::set_var("DBFLEET_TEST_BOOL_FALSE", "0");
        assert_eq!(get_env_bool("DBFLEET_TEST_BOOL_TRUE"), Some(true));
        assert_eq!(get_env_bool("DBFLEET_TEST_BOOL_FALSE"), Some(false));
        std::env::remove_var("DBFLEET_TEST_BOOL_TRUE");
        std::env::remove_var("DBFLEET_TEST_BOOL_FALSE");
    }

    #[test]
    fn retry_gives_up_after_max_tries() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), &str> = retry(
            || {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err("still failing")
            },
            3,
        );
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
