#[cfg(target_os = "linux")]
pub(crate) mod linux;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd"
))]
pub(crate) mod bsd;
