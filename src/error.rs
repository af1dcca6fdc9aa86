//
// Error generator macro
//
use log::error;

macro_rules! make_error {
    ( $struct:ident; $( $name:ident ( $ty:ty, _): $show_cause:expr, $usr_msg_fun:expr ),+ $(,)* ) => {
        #[derive(Debug)]
        #[allow(unused_variables, dead_code)]
        pub enum $struct {
            $($name( $ty, String )),+
        }
        $(impl From<$ty> for $struct {
            fn from(err: $ty) -> Self {
                $struct::$name(err, String::from(stringify!($name)))
            }
        })+
        $(impl From<($ty, String)> for $struct {
            fn from(err: ($ty, String)) -> Self {
                $struct::$name(err.0, err.1)
            }
        })+
        impl $struct {
            pub fn with_msg<M: Into<String>>(self, msg: M) -> Self {
                match self {$(
                   $struct::$name(e, _) => $struct::$name(e, msg.into()),
                )+}
            }
            // First value is log message, second is user message
            pub fn display_error(self) -> String {
                match &self {$(
                   $struct::$name(e, s) => {
                       let log_msg = format!("{}. {}", &s, &e);

                        error!("{}", log_msg);
                        if $show_cause {
                            error!("[CAUSE] {:?}", e);
                        }

                        $usr_msg_fun(e, s)
                   },
                )+}
            }
        }

    };
}

use std::any::Any;

// Error struct
// Each variant has two elements, the first is an error of different types, used for logging purposes
// The second is a String, and its contents are displayed to the caller when the error occurs. Inside
// the macro, this is represented as _.
//
// After the variant itself, there are two expressions. The first is a bool indicating whether the
// error cause is also printed to the log. The second is the function used to build the caller-facing
// message.
make_error! {
    Error;
    // Used to represent err! calls
    SimpleError(String, _): false, _plain,
    IoError(std::io::Error, _): true, _plain,
    SerdeError(serde_json::Error, _): true, _plain,
    DotenvError(dotenvy::Error, _): false, _plain,
}

impl Error {
    pub fn new<M: Into<String>, N: Into<String>>(usr_msg: M, log_msg: N) -> Self {
        Error::SimpleError(log_msg.into(), usr_msg.into())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::SimpleError(e, s) => write!(f, "{s}: {e}"),
            Error::IoError(e, s) => write!(f, "{s}: {e}"),
            Error::SerdeError(e, s) => write!(f, "{s}: {e}"),
            Error::DotenvError(e, s) => write!(f, "{s}: {e}"),
        }
    }
}

impl std::error::Error for Error {}

fn _plain(_: &impl Any, msg: &str) -> String {
    msg.to_string()
}

///
/// Error return macro
///
#[macro_export]
macro_rules! err {
    ($msg:expr) => {{
        return Err($crate::error::Error::new($msg, $msg));
    }};
    ($usr_msg:expr, $log_value:expr) => {{
        return Err($crate::error::Error::new($usr_msg, $log_value));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_error_carries_message() {
        let e = Error::new("bad config", "bad config: missing DATABASE_URL");
        match &e {
            Error::SimpleError(log, usr) => {
                assert_eq!(usr, "bad config");
                assert_eq!(log, "bad config: missing DATABASE_URL");
            }
            _ => panic!("expected SimpleError"),
        }
    }

    #[test]
    fn with_msg_replaces_message_keeping_variant() {
        let e = Error::from(std::io::Error::other("boom")).with_msg("failed to read config file");
        assert!(matches!(e, Error::IoError(_, _)));
    }
}
