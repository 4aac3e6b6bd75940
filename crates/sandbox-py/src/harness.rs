//! Restricted-runtime harness.
//!
//! [`wrap`] turns untrusted source into a self-contained Python program that
//! installs import and builtin restrictions, applies resource limits, runs the
//! user code against captured stdout/stderr, and reports the result between
//! fixed markers. [`split_output`] parses that report back.
//!
//! Imports issued by the user script must name an allowed top-level module.
//! An audit hook then refuses process, network and native-library events
//! outright, and refuses filesystem events whose nearest caller is user code
//! rather than the import machinery. Everything in-process is still an
//! interior layer: the supervisor's timeout, memory polling and process-group
//! kill are what actually bound a run.

use sandbox::SandboxConfig;

pub const STDOUT_MARKER: &str = "=== STDOUT ===\n";
pub const STDERR_MARKER: &str = "\n=== STDERR ===\n";
pub const END_MARKER: &str = "\n=== END ===\n";
const MEMORY_MARKER: &str = "MEMORY_USAGE:";

/// Blocked for every importer, enforced through `sys.meta_path`.
pub const DEFAULT_BLOCKED_IMPORTS: &[&str] = &[
    "os",
    "subprocess",
    "socket",
    "urllib",
    "urllib2",
    "httplib",
    "http",
    "ftplib",
    "telnetlib",
    "smtplib",
    "poplib",
    "imaplib",
    "nntplib",
    "ssl",
    "ctypes",
    "multiprocessing",
    "threading",
    "thread",
    "_thread",
    "pty",
    "termios",
    "tty",
    "fcntl",
    "grp",
    "pwd",
    "spwd",
    "crypt",
    "dl",
    "nis",
    "syslog",
    "commands",
    "popen2",
    "pipes",
    "_posixsubprocess",
    "_ctypes",
    "_socket",
];

/// Blocked only for imports issued by the user script itself. Libraries the
/// script uses may still load these. Checked before the allow-list, so adding
/// one of these to `allowed_modules` does not unblock it.
pub const DEFAULT_GUARDED_IMPORTS: &[&str] = &[
    "builtins",
    "importlib",
    "sys",
    "posix",
    "nt",
    "gc",
    "inspect",
    "io",
    "_io",
    "pathlib",
    "shutil",
    "tempfile",
    "glob",
    "fileinput",
];

/// Standard-library modules a user script may import on top of the
/// configured `allowed_modules`.
pub const SAFE_STDLIB_IMPORTS: &[&str] = &[
    "__future__",
    "abc",
    "array",
    "base64",
    "binascii",
    "bisect",
    "calendar",
    "cmath",
    "collections",
    "copy",
    "csv",
    "dataclasses",
    "datetime",
    "decimal",
    "difflib",
    "enum",
    "fractions",
    "functools",
    "hashlib",
    "heapq",
    "html",
    "itertools",
    "json",
    "math",
    "numbers",
    "operator",
    "pprint",
    "random",
    "re",
    "statistics",
    "string",
    "struct",
    "textwrap",
    "time",
    "typing",
    "unicodedata",
];

/// Audit events refused wherever they come from once user code is running.
pub const DEFAULT_DENIED_EVENTS: &[&str] = &[
    "os.system",
    "os.exec",
    "os.posix_spawn",
    "os.spawn",
    "os.fork",
    "os.forkpty",
    "os.kill",
    "os.killpg",
    "os.putenv",
    "os.unsetenv",
    "os.startfile",
    "subprocess.Popen",
    "pty.spawn",
    "socket.__new__",
    "socket.connect",
    "socket.bind",
    "socket.getaddrinfo",
    "ctypes.dlopen",
    "ctypes.dlsym",
    "resource.setrlimit",
];

/// Audit events refused when user code initiated them. The import machinery
/// still reads and lists files on the script's behalf.
pub const DEFAULT_USER_FILE_EVENTS: &[&str] = &[
    "open",
    "os.listdir",
    "os.scandir",
    "os.chdir",
    "os.chmod",
    "os.chown",
    "os.link",
    "os.mkdir",
    "os.remove",
    "os.rename",
    "os.rmdir",
    "os.symlink",
    "os.truncate",
    "os.utime",
    "shutil.copyfile",
    "shutil.copytree",
    "shutil.move",
    "shutil.rmtree",
    "shutil.make_archive",
    "shutil.unpack_archive",
    "tempfile.mkstemp",
    "tempfile.mkdtemp",
];

pub const DEFAULT_CPU_SECONDS: u64 = 30;

/// What a neutered builtin returns instead of doing its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stub {
    None,
    EmptyString,
}

impl Stub {
    fn literal(self) -> &'static str {
        match self {
            Stub::None => "None",
            Stub::EmptyString => "\"\"",
        }
    }
}

pub const DEFAULT_NEUTERED_BUILTINS: &[(&str, Stub)] = &[
    ("eval", Stub::None),
    ("exec", Stub::None),
    ("compile", Stub::None),
    ("open", Stub::None),
    ("input", Stub::EmptyString),
    ("raw_input", Stub::EmptyString),
];

/// Every list and number baked into the generated program.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessPolicy {
    pub blocked_imports: Vec<String>,
    pub guarded_imports: Vec<String>,
    /// Top-level modules the user script may import.
    pub allowed_imports: Vec<String>,
    pub denied_events: Vec<String>,
    pub user_file_events: Vec<String>,
    pub neutered_builtins: Vec<(String, Stub)>,
    /// `RLIMIT_AS` in bytes.
    pub memory_limit: Option<u64>,
    /// `RLIMIT_CPU` in seconds.
    pub cpu_seconds: Option<u64>,
    /// Interior `SIGALRM` timeout, a backstop for the supervisor deadline.
    /// Zero disables it.
    pub alarm_seconds: u64,
}

impl HarnessPolicy {
    pub fn from_config(config: &SandboxConfig) -> Self {
        // One second past the supervisor deadline, so the alarm only fires
        // when the exterior kill did not.
        let alarm_seconds = config.timeout_ms.div_ceil(1000) + 1;
        let mut allowed_imports = to_strings(SAFE_STDLIB_IMPORTS);
        for module in &config.allowed_modules {
            if !allowed_imports.contains(module) {
                allowed_imports.push(module.clone());
            }
        }
        Self {
            blocked_imports: to_strings(DEFAULT_BLOCKED_IMPORTS),
            guarded_imports: to_strings(DEFAULT_GUARDED_IMPORTS),
            allowed_imports,
            denied_events: to_strings(DEFAULT_DENIED_EVENTS),
            user_file_events: to_strings(DEFAULT_USER_FILE_EVENTS),
            neutered_builtins: DEFAULT_NEUTERED_BUILTINS
                .iter()
                .map(|(name, stub)| ((*name).to_string(), *stub))
                .collect(),
            memory_limit: (config.max_memory > 0).then_some(config.max_memory),
            cpu_seconds: Some(DEFAULT_CPU_SECONDS.max(alarm_seconds + 1)),
            alarm_seconds,
        }
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Python literal for `value`. JSON string and list syntax is valid Python.
fn py_literal<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "None".to_string())
}

fn limits_section(policy: &HarnessPolicy) -> String {
    let mut out = String::new();
    if let Some(bytes) = policy.memory_limit {
        out.push_str(&format!(
            r#"try:
    import resource as _sb_resource
    _sb_resource.setrlimit(_sb_resource.RLIMIT_AS, ({bytes}, {bytes}))
except Exception:
    pass
"#
        ));
    }
    if let Some(secs) = policy.cpu_seconds {
        out.push_str(&format!(
            r#"try:
    import resource as _sb_resource
    _sb_resource.setrlimit(_sb_resource.RLIMIT_CPU, ({secs}, {secs}))
except Exception:
    pass
"#
        ));
    }
    out.push_str("_sb_alarm_armed = False\n");
    if policy.alarm_seconds > 0 {
        out.push_str(&format!(
            r#"try:
    import signal as _sb_signal

    def _sb_on_alarm(signum, frame):
        raise TimeoutError("Script execution timed out")

    _sb_signal.signal(_sb_signal.SIGALRM, _sb_on_alarm)
    _sb_signal.alarm({secs})
    _sb_alarm_armed = True
except Exception:
    pass
"#,
            secs = policy.alarm_seconds
        ));
    }
    out
}

fn neutered_section(policy: &HarnessPolicy) -> String {
    policy
        .neutered_builtins
        .iter()
        .map(|(name, stub)| {
            format!(
                "_sb_user_builtins[{}] = _sb_neutered({})\n",
                py_literal(name.as_str()),
                stub.literal()
            )
        })
        .collect()
}

/// Wrap `script` into the harness program. Pure: no I/O, no clock.
pub fn wrap(script: &str, policy: &HarnessPolicy) -> String {
    format!(
        r#"import builtins as _sb_builtins
import contextlib as _sb_contextlib
import io as _sb_io
import sys as _sb_sys

_SB_BLOCKED = frozenset({blocked})
_SB_GUARDED = frozenset({guarded})
_SB_ALLOWED = frozenset({allowed})
_SB_DENIED_EVENTS = frozenset({denied_events})
_SB_USER_FILE_EVENTS = frozenset({user_file_events})
_SB_DIRECT_EVENTS = frozenset(["compile", "exec", "code.__new__", "object.__setattr__"])
_SB_USER_FILENAME = "<sandbox>"
_SB_SOURCE = {source}

{limits}

def _sb_root_in(name, modules):
    return name.split(".", 1)[0] in modules


class _SbImportBlocker(object):
    def find_spec(self, fullname, path=None, target=None):
        if _sb_root_in(fullname, _SB_BLOCKED):
            raise ImportError("Import of module '%s' is not allowed in sandbox" % fullname)
        return None


_sb_sys.meta_path.insert(0, _SbImportBlocker())

_sb_real_import = _sb_builtins.__import__
_sb_real_compile = _sb_builtins.compile
_sb_real_exec = _sb_builtins.exec


def _sb_guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level == 0 and (
        _sb_root_in(name, _SB_BLOCKED)
        or _sb_root_in(name, _SB_GUARDED)
        or not _sb_root_in(name, _SB_ALLOWED)
    ):
        raise ImportError("Import of module '%s' is not allowed in sandbox" % name)
    return _sb_real_import(name, globals, locals, fromlist, level)


def _sb_user_initiated(frame):
    while frame is not None:
        filename = frame.f_code.co_filename
        if filename == _SB_USER_FILENAME:
            return True
        if filename.startswith("<frozen importlib.") or filename == "<frozen zipimport>":
            return False
        frame = frame.f_back
    return False


def _sb_caller():
    try:
        return _sb_sys._getframe(2)
    except ValueError:
        return None


def _sb_audit(event, args):
    if event in _SB_DENIED_EVENTS:
        raise PermissionError("Operation '%s' is not allowed in sandbox" % event)
    if event in _SB_USER_FILE_EVENTS:
        denied = _sb_user_initiated(_sb_caller())
    elif event in _SB_DIRECT_EVENTS:
        if event == "object.__setattr__" and (len(args) < 2 or args[1] != "__code__"):
            return
        caller = _sb_caller()
        denied = caller is not None and caller.f_code.co_filename == _SB_USER_FILENAME
    else:
        return
    if denied:
        raise PermissionError("Operation '%s' is not allowed in sandbox" % event)


def _sb_neutered(value):
    def _sb_stub(*args, **kwargs):
        return value
    return _sb_stub


_sb_user_builtins = dict(_sb_builtins.__dict__)
_sb_user_builtins["__import__"] = _sb_guarded_import
_sb_user_builtins.pop("__loader__", None)
_sb_user_builtins.pop("__spec__", None)
{neutered}
_sb_user_globals = dict(__name__="__main__", __builtins__=_sb_user_builtins)

_sb_stdout = _sb_io.StringIO()
_sb_stderr = _sb_io.StringIO()
_sb_status = 0

if hasattr(_sb_sys, "addaudithook"):
    _sb_sys.addaudithook(_sb_audit)

try:
    with _sb_contextlib.redirect_stdout(_sb_stdout), _sb_contextlib.redirect_stderr(_sb_stderr):
        try:
            _sb_real_exec(_sb_real_compile(_SB_SOURCE, _SB_USER_FILENAME, "exec"), _sb_user_globals)
        except SystemExit as _sb_exit:
            if _sb_exit.code is None:
                _sb_status = 0
            elif isinstance(_sb_exit.code, int):
                _sb_status = _sb_exit.code
            else:
                _sb_stderr.write(str(_sb_exit.code) + "\n")
                _sb_status = 1
        except BaseException as _sb_error:
            _sb_stderr.write("Execution error: %s: %s\n" % (type(_sb_error).__name__, _sb_error))
            _sb_status = 1
finally:
    if _sb_alarm_armed:
        _sb_signal.alarm(0)

_sb_memory = 0
try:
    import resource as _sb_resource
    _sb_memory = _sb_resource.getrusage(_sb_resource.RUSAGE_SELF).ru_maxrss
    if _sb_sys.platform != "darwin":
        _sb_memory *= 1024
except Exception:
    pass

_sb_out = _sb_sys.stdout
_sb_out.write({stdout_marker})
_sb_out.write(_sb_stdout.getvalue())
_sb_out.write({stderr_marker})
_sb_out.write(_sb_stderr.getvalue())
_sb_out.write({end_marker})
_sb_out.write("{memory_marker}%d\n" % _sb_memory)
_sb_out.flush()
_sb_sys.exit(_sb_status)
"#,
        blocked = py_literal(&policy.blocked_imports),
        guarded = py_literal(&policy.guarded_imports),
        allowed = py_literal(&policy.allowed_imports),
        denied_events = py_literal(&policy.denied_events),
        user_file_events = py_literal(&policy.user_file_events),
        source = py_literal(script),
        limits = limits_section(policy),
        neutered = neutered_section(policy),
        stdout_marker = py_literal(STDOUT_MARKER),
        stderr_marker = py_literal(STDERR_MARKER),
        end_marker = py_literal(END_MARKER),
        memory_marker = MEMORY_MARKER,
    )
}

/// The harness report, split back into its sections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarnessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Self-reported peak RSS. Cooperative, so only a fallback.
    pub memory_used: Option<u64>,
    /// The end marker was seen: the harness finished writing its report.
    pub complete: bool,
}

/// Split a raw stdout stream produced by [`wrap`].
///
/// Without the start marker (killed before reporting, interpreter crash) the
/// whole stream is treated as stdout.
pub fn split_output(raw: &str) -> HarnessOutput {
    let Some((_, body)) = raw.split_once(STDOUT_MARKER) else {
        return HarnessOutput {
            stdout: raw.to_owned(),
            ..Default::default()
        };
    };

    let (sections, tail, complete) = match body.rsplit_once(END_MARKER) {
        Some((sections, tail)) => (sections, tail, true),
        None => (body, "", false),
    };
    let (stdout, stderr) = sections.rsplit_once(STDERR_MARKER).unwrap_or((sections, ""));

    HarnessOutput {
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
        memory_used: parse_memory_marker(tail),
        complete,
    }
}

fn parse_memory_marker(tail: &str) -> Option<u64> {
    tail.lines()
        .find_map(|line| line.trim().strip_prefix(MEMORY_MARKER))
        .and_then(|digits| digits.trim().parse().ok())
}
