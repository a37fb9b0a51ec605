/// Unwraps an `Ok`, panicking with the error otherwise.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(err) => panic!("expected Ok(_), got Err({:?})", err),
        }
    };
}

/// Unwraps an `Err` so the caller can match on it.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match $expr {
            Ok(_) => panic!("expected Err(_), got Ok(_)"),
            Err(err) => err,
        }
    };
}
