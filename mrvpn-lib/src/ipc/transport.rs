//! Platform transport for the local control channel: a named pipe on
//! Windows, a unix socket everywhere else.

#[cfg(windows)]
pub use windows_impl::{Listener, Stream};

#[cfg(unix)]
pub use unix_impl::{Listener, Stream};

#[cfg(windows)]
mod windows_impl {
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    use std::ffi::c_void;
    use std::io;

    use windows::Win32::Foundation::{HLOCAL, LocalFree};
    use windows::Win32::Security::Authorization::{
        ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
    };
    use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};
    use windows::core::PCWSTR;

    const IN_BUFFER: u32 = 64 * 1024;
    const OUT_BUFFER: u32 = 1024 * 1024;
    // full access for SYSTEM and Administrators, read/write for interactive users
    const PIPE_SDDL: &str = "D:(A;;GA;;;SY)(A;;GA;;;BA)(A;;GRGW;;;IU)";

    pub type Stream = NamedPipeServer;

    /// Keeps one pipe instance pending so a client connect never races the
    /// creation of the next instance.
    pub struct Listener {
        name: String,
        pending: NamedPipeServer,
    }

    impl Listener {
        pub fn bind(name: &str) -> io::Result<Self> {
            let pending = create_instance(name, true)?;
            Ok(Listener {
                name: name.to_string(),
                pending,
            })
        }

        pub async fn accept(&mut self) -> io::Result<Stream> {
            self.pending.connect().await?;
            let next = create_instance(&self.name, false)?;
            Ok(std::mem::replace(&mut self.pending, next))
        }
    }

    fn create_instance(name: &str, first: bool) -> io::Result<NamedPipeServer> {
        let sddl: Vec<u16> = PIPE_SDDL.encode_utf16().chain(std::iter::once(0)).collect();
        let mut descriptor = PSECURITY_DESCRIPTOR::default();
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                PCWSTR(sddl.as_ptr()),
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )
        }
        .map_err(io::Error::other)?;

        let mut attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: descriptor.0,
            bInheritHandle: false.into(),
        };

        let result = unsafe {
            ServerOptions::new()
                .first_pipe_instance(first)
                .in_buffer_size(IN_BUFFER)
                .out_buffer_size(OUT_BUFFER)
                .create_with_security_attributes_raw(name, &mut attributes as *mut _ as *mut c_void)
        };
        unsafe {
            let _ = LocalFree(Some(HLOCAL(descriptor.0)));
        }
        result
    }
}

#[cfg(unix)]
mod unix_impl {
    use tokio::net::{UnixListener, UnixStream};

    use std::io;
    use std::path::{Path, PathBuf};

    pub type Stream = UnixStream;

    pub struct Listener {
        inner: UnixListener,
        path: PathBuf,
    }

    impl Listener {
        pub fn bind(path: &str) -> io::Result<Self> {
            let path = Path::new(path);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            let inner = UnixListener::bind(path)?;
            Ok(Listener {
                inner,
                path: path.to_path_buf(),
            })
        }

        pub async fn accept(&mut self) -> io::Result<Stream> {
            self.inner.accept().await.map(|(stream, _)| stream)
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(error = %e, "failed removing socket file");
            }
        }
    }
}
