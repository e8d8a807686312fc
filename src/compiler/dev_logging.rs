// CODEGEN LOGGING MACROS
#[macro_export]
#[cfg(feature = "show_codegen")]
macro_rules! codegen_log {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[macro_export]
#[cfg(not(feature = "show_codegen"))]
macro_rules! codegen_log {
    ($($arg:tt)*) => {
        // Nothing
    };
}

// WAT OUTPUT LOGGING MACROS
#[macro_export]
#[cfg(feature = "show_wat")]
macro_rules! wat_log {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[macro_export]
#[cfg(not(feature = "show_wat"))]
macro_rules! wat_log {
    ($($arg:tt)*) => {
        // Nothing
    };
}
