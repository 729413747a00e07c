use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error(core::ffi::c_int);

impl Error {
    #[inline]
    pub fn as_isize(self) -> isize {
        self.0 as isize
    }

    #[inline]
    pub fn errno(self) -> core::ffi::c_int {
        self.0
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error({})", errno::error_name(self.as_isize()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(errno::error_info(self.as_isize()))
    }
}

pub type KResult<T = isize> = core::result::Result<T, Error>;

pub mod errno {
    macro_rules! declare_errno {
        ($($name:tt, $errno:literal, $desc:literal,)*) => {
            $(#[doc = $desc]
            pub const $name: super::Error = super::Error($errno);)*

            pub fn error_info(errno: isize) -> &'static str {
                match errno {
                    $($errno => ::core::concat!(stringify!($name), ", ", $desc),)*
                    _ => "Unknown error",
                }
            }

            pub fn error_name(errno: isize) -> &'static str {
                match errno {
                    $($errno => stringify!($name),)*
                    _ => "UNKNOWN",
                }
            }
        };
    }

    #[rustfmt::skip]
    declare_errno!(
        EIO,            -5,     "I/O error.",
        EBADF,          -9,     "Bad file number.",
        ENOMEM,         -12,    "Out of memory.",
        EACCES,         -13,    "Permission denied.",
        EFAULT,         -14,    "Bad address.",
        EEXIST,         -17,    "File exists.",
        EINVAL,         -22,    "Invalid argument.",
        ENOSPC,         -28,    "No space left on device.",
    );
}
