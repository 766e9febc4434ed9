/// Calls a libc function that signals failure by returning -1 and converts the result to an `io::Result`
///
/// Failures are logged with the function name. Errnos listed after `expect` are returned silently, for calls where
/// they are part of normal operation: `libc_call!(libc::read(fd, buf, len), expect: [libc::EAGAIN])`.
#[macro_export]
macro_rules! libc_call {
    ( $i:ident $( :: $sub_i:ident )* ( $( $arg:expr ),* $(,)? ) $(, expect: [ $( $errno:expr ),* $(,)? ] )? ) => {{
        const FUNCTION_NAME: &'static str = concat!(stringify!($i) $(, "::", stringify!($sub_i) )*);
        let span = ::tracing::trace_span!(target: "libc", FUNCTION_NAME);
        let _guard = span.enter();
        match $i $( :: $sub_i )* ( $( $arg, )* ) {
            ret if ret == -1 => {
                let err = ::std::io::Error::last_os_error();
                let expected: &[::std::os::raw::c_int] = &[ $( $( $errno ),* )? ];
                if !err.raw_os_error().map_or(false, |errno| expected.contains(&errno)) {
                    ::tracing::debug!(target: "libc", code = "libc_call_failed", error = %err, "{} failed", FUNCTION_NAME);
                }
                ::std::result::Result::Err(err)
            }
            ret => ::std::result::Result::Ok(ret),
        }
    }};
}
