// jobsentry: fork/exec wrapper for the externally-monitored child process
// ACCEPTABLE: Mutex poisoning .expect() is allowed in this module (unrecoverable error)
#![allow(clippy::expect_used)]

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub struct LaunchOptions {
    pub exe: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

pub type OnExit = Box<dyn Fn(i32, i32) + Send + Sync>;

/// Launches one child per call via fork/exec and reports its exit code
/// through a registered callback, invoked outside any lock the starter
/// itself holds. `shutdown` force-kills and joins every outstanding wait
/// thread.
pub struct JobStarter {
    callback: Arc<Mutex<Option<OnExit>>>,
    shutdown_flag: Arc<AtomicBool>,
    waiters: Mutex<Vec<JoinHandle<()>>>,
}

impl JobStarter {
    pub fn new() -> Self {
        Self {
            callback: Arc::new(Mutex::new(None)),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn set_callback<F: Fn(i32, i32) + Send + Sync + 'static>(&self, callback: F) {
        *self.callback.lock().expect("job starter callback mutex poisoned") = Some(Box::new(callback));
    }

    /// Returns the child's pid on success.
    pub fn launch(&self, options: LaunchOptions) -> std::io::Result<i32> {
        let exe = CString::new(options.exe.clone())?;
        let mut c_args: Vec<CString> = vec![exe.clone()];
        for arg in &options.args {
            c_args.push(CString::new(arg.clone())?);
        }
        let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if pid == 0 {
            unsafe {
                let uid = libc::getuid();
                libc::setuid(uid);
                libc::seteuid(uid);
                libc::execvp(exe.as_ptr(), argv.as_ptr());
                libc::_exit(127);
            }
        }

        let callback = Arc::clone(&self.callback);
        let shutdown_flag = Arc::clone(&self.shutdown_flag);
        let timeout = options.timeout;
        let handle = std::thread::spawn(move || {
            let deadline = timeout.map(|t| Instant::now() + t);
            let exit_code = loop {
                if shutdown_flag.load(Ordering::SeqCst) {
                    unsafe {
                        libc::kill(pid, libc::SIGKILL);
                    }
                    wait_blocking(pid);
                    break 137;
                }
                let mut status = 0i32;
                let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                if result == pid {
                    break decode_exit_status(status);
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        unsafe {
                            libc::kill(pid, libc::SIGKILL);
                        }
                        wait_blocking(pid);
                        break 137;
                    }
                }
                std::thread::sleep(Duration::from_millis(10));
            };

            if let Some(cb) = callback.lock().expect("job starter callback mutex poisoned").as_ref() {
                cb(pid, exit_code);
            }
        });

        self.waiters.lock().expect("job starter waiters mutex poisoned").push(handle);
        Ok(pid)
    }

    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        let mut waiters = self.waiters.lock().expect("job starter waiters mutex poisoned");
        for handle in waiters.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Default for JobStarter {
    fn default() -> Self {
        Self::new()
    }
}

fn wait_blocking(pid: i32) {
    let mut status = 0i32;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
}

fn decode_exit_status(status: i32) -> i32 {
    unsafe {
        if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else if libc::WIFSIGNALED(status) {
            128 + libc::WTERMSIG(status)
        } else {
            -1
        }
    }
}
