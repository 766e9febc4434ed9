/// Runs a fallible call inside a trace span and logs the error, with the called function's name, on failure
///
/// Errors of an `io::ErrorKind` listed after `expect` are returned without being logged, for callers that handle
/// them as an ordinary outcome: `trace_call_result!(fs::read_to_string(path), expect: [NotFound])`.
#[macro_export]
macro_rules! trace_call_result {
    ( expr: $call:expr, function_name: $function_name:expr, expect: [ $( $kind:ident ),* ] ) => {{
        const FUNCTION_NAME: &'static str = $function_name;
        let span = ::tracing::trace_span!(FUNCTION_NAME);
        let _guard = span.enter();
        match $call {
            ::std::result::Result::Ok(x) => ::std::result::Result::Ok(x),
            ::std::result::Result::Err(err) => {
                if !$crate::tracing::is_expected(&err, &[ $( ::std::io::ErrorKind::$kind ),* ]) {
                    let err_ref: &(dyn ::std::error::Error + 'static) = &err;
                    ::tracing::error!(code = "call_failed", error = err_ref, "{} failed: {}", FUNCTION_NAME, err);
                }
                ::std::result::Result::Err(err)
            }
        }
    }};
    ( $receiver:tt . $i:ident ( $( $arg:expr ),* $(,)? ) $(, expect: [ $( $kind:ident ),* ] )? ) => {
        $crate::trace_call_result!(
            expr: $receiver . $i ( $( $arg, )* ),
            function_name: stringify!($i),
            expect: [ $( $( $kind ),* )? ]
        )
    };
    ( $i:ident $( :: $sub_i:ident )* ( $( $arg:expr ),* $(,)? ) $(, expect: [ $( $kind:ident ),* ] )? ) => {
        $crate::trace_call_result!(
            expr: $i $( :: $sub_i )* ( $( $arg, )* ),
            function_name: concat!(stringify!($i) $(, "::", stringify!($sub_i) )*),
            expect: [ $( $( $kind ),* )? ]
        )
    };
}

/// Upcasts an error to `dyn Error + 'static` so it can be recorded as an event field
pub fn error_value<T: std::error::Error + 'static>(e: &T) -> &(dyn std::error::Error + 'static) {
    e
}

#[doc(hidden)]
pub fn is_expected<E: std::error::Error + 'static>(err: &E, kinds: &[std::io::ErrorKind]) -> bool {
    let err: &(dyn std::error::Error + 'static) = err;
    match err.downcast_ref::<std::io::Error>() {
        Some(err) => kinds.contains(&err.kind()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, io};

    #[test]
    fn expected_kinds_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = trace_call_result!(fs::read_to_string(&missing), expect: [NotFound]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let written = trace_call_result!(fs::write(&missing, "x"));
        assert!(written.is_ok());
        assert_eq!(trace_call_result!(fs::read_to_string(&missing)).unwrap(), "x");
    }

    #[test]
    fn only_io_errors_can_be_expected() {
        let parse = "x".parse::<u16>().unwrap_err();
        assert!(!super::is_expected(&parse, &[io::ErrorKind::InvalidData]));
        let io = io::Error::new(io::ErrorKind::WouldBlock, "busy");
        assert!(super::is_expected(&io, &[io::ErrorKind::WouldBlock]));
    }
}
