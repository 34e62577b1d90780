//! Command line parsing and the immutable sandbox configuration.
//!
//! The flag surface is getopt-like: single-dash short options, `--` ends
//! the flags and everything after it is the command to run. `-M`/`-m`/`-w`
//! groups are order-sensitive (an `-M` source may be followed by at most
//! one target option), so the interleaving is reconstructed from the
//! occurrence indices clap reports and replayed through a small state
//! machine. Arguments of the form `@FILE` are expanded in place from the
//! newline-separated contents of FILE before clap ever sees them.

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::{Arg, ArgAction, ArgMatches, Command};
use nix::unistd;

/// The uid and gid of the user and group "nobody".
pub const NOBODY_UID: u32 = 65534;
pub const NOBODY_GID: u32 = 65534;

/// How deep `@FILE` arguments may reference further `@FILE` arguments.
const MAX_ARG_FILE_DEPTH: usize = 8;

/// A single bind mount requested on the command line, in declaration
/// order. Later mounts may shadow earlier ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
    /// Absolute path on the host.
    pub source: PathBuf,
    /// Absolute path inside the sandbox.
    pub target: PathBuf,
    pub writable: bool,
}

/// Everything the pipeline needs, fixed once parsing is done.
#[derive(Clone, Debug)]
pub struct Config {
    pub sandbox_root: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub argv: Vec<String>,
    pub mounts: Vec<Mount>,
    pub create_dirs: Vec<PathBuf>,
    pub inner_uid: u32,
    pub inner_gid: u32,
    pub create_netns: bool,
    pub host_name: Option<String>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub debug: bool,
}

/// What the command line asked for: the capability probe short-circuits
/// before any of the mandatory options are checked.
#[derive(Debug)]
pub enum Invocation {
    Probe,
    Run(Box<Config>),
}

pub fn build_command() -> Command {
    Command::new("nsbox")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Runs a command inside a namespace-isolated sandbox root")
        .arg(
            Arg::new("sandbox-root")
                .short('S')
                .value_name("DIR")
                .action(ArgAction::Append)
                .help("directory which will become the root of the sandbox"),
        )
        .arg(
            Arg::new("working-dir")
                .short('W')
                .value_name("DIR")
                .action(ArgAction::Append)
                .help("working directory inside the sandbox"),
        )
        .arg(
            Arg::new("mount-source")
                .short('M')
                .value_name("PATH")
                .action(ArgAction::Append)
                .help("host path to mount in the sandbox, read-only at the same path unless followed by -m or -w"),
        )
        .arg(
            Arg::new("mount-target")
                .short('m')
                .value_name("PATH")
                .action(ArgAction::Append)
                .help("where to mount the preceding -M path, read-only"),
        )
        .arg(
            Arg::new("mount-target-rw")
                .short('w')
                .value_name("PATH")
                .action(ArgAction::Append)
                .help("where to mount the preceding -M path, read-write"),
        )
        .arg(
            Arg::new("create-dir")
                .short('d')
                .value_name("DIR")
                .action(ArgAction::Append)
                .help("create an empty directory in the sandbox"),
        )
        .arg(
            Arg::new("netns")
                .short('n')
                .action(ArgAction::Count)
                .help("create a new network namespace and bring up a loopback interface"),
        )
        .arg(
            Arg::new("as-caller")
                .short('i')
                .action(ArgAction::Count)
                .help("use the caller's uid/gid inside the sandbox"),
        )
        .arg(
            Arg::new("as-root")
                .short('r')
                .action(ArgAction::Count)
                .help("use root (0/0) inside the sandbox instead of nobody"),
        )
        .arg(
            Arg::new("hostname")
                .short('H')
                .value_name("NAME")
                .action(ArgAction::Append)
                .help("set the sandbox host name"),
        )
        .arg(
            Arg::new("stdout")
                .short('l')
                .value_name("FILE")
                .action(ArgAction::Append)
                .allow_hyphen_values(true)
                .help("redirect stdout to a file (\"-\" keeps it untouched)"),
        )
        .arg(
            Arg::new("stderr")
                .short('L')
                .value_name("FILE")
                .action(ArgAction::Append)
                .allow_hyphen_values(true)
                .help("redirect stderr to a file (\"-\" keeps it untouched)"),
        )
        .arg(
            Arg::new("debug")
                .short('D')
                .action(ArgAction::Count)
                .help("print debug output"),
        )
        .arg(
            Arg::new("probe")
                .short('C')
                .action(ArgAction::Count)
                .help("only check whether the kernel supports all required namespaces"),
        )
        .arg(
            Arg::new("command")
                .value_name("COMMAND")
                .num_args(0..)
                .last(true)
                .help("command to run inside the sandbox, preceded by --"),
        )
}

fn usage_error(msg: impl std::fmt::Display) -> anyhow::Error {
    let mut cmd = build_command();
    anyhow!("{msg}\n\n{}", cmd.render_usage())
}

/// Short options that consume the following argument; their values are
/// never candidates for `@FILE` expansion.
const VALUE_FLAGS: [&str; 9] = [
    "-S", "-W", "-M", "-m", "-w", "-d", "-H", "-l", "-L",
];

/// Expands `@FILE` arguments in place: each is replaced by the
/// newline-separated contents of FILE, with empty lines skipped and
/// nested `@FILE` lines expanded in turn. A `--` stops the expansion for
/// the remainder of the vector it appears in, so command arguments are
/// never rewritten.
pub fn expand_arg_files(args: Vec<String>) -> Result<Vec<String>> {
    expand_arg_files_at(args, 0)
}

fn expand_arg_files_at(args: Vec<String>, depth: usize) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(args.len());
    let mut literal = false;
    let mut skip_next = false;
    for arg in args {
        if literal || skip_next {
            skip_next = false;
            out.push(arg);
        } else if arg == "--" {
            literal = true;
            out.push(arg);
        } else if VALUE_FLAGS.contains(&arg.as_str()) {
            skip_next = true;
            out.push(arg);
        } else if let Some(filename) = arg.strip_prefix('@') {
            if depth >= MAX_ARG_FILE_DEPTH {
                return Err(usage_error(format!(
                    "Argument files nested more than {} levels deep at @{}",
                    MAX_ARG_FILE_DEPTH, filename
                )));
            }
            let contents = fs::read_to_string(filename)
                .with_context(|| format!("opening argument file {} failed", filename))?;
            let lines: Vec<String> = contents
                .lines()
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect();
            out.extend(expand_arg_files_at(lines, depth + 1)?);
        } else {
            out.push(arg);
        }
    }
    Ok(out)
}

/// Parses a full argument vector (including the program name) into an
/// [`Invocation`]. Configuration errors carry the offending option and a
/// usage dump.
pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Invocation> {
    let args = expand_arg_files(args.into_iter().collect())?;

    let matches = match build_command().try_get_matches_from(&args) {
        Ok(matches) => matches,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            err.exit()
        }
        Err(err) => return Err(err.into()),
    };

    if matches.get_count("probe") > 0 {
        return Ok(Invocation::Probe);
    }

    let sandbox_root = parse_sandbox_root(&matches)?;
    let working_dir = parse_single_path(&matches, "working-dir", 'W', "working directories")?;
    let mounts = parse_mounts(&matches)?;
    let create_dirs = parse_create_dirs(&matches)?;
    let (inner_uid, inner_gid) = parse_identity(&matches);
    let stdout_path = parse_redirect(&matches, "stdout")?;
    let stderr_path = parse_redirect(&matches, "stderr")?;

    let argv: Vec<String> = matches
        .get_many::<String>("command")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if argv.is_empty() {
        return Err(usage_error("No command specified."));
    }

    Ok(Invocation::Run(Box::new(Config {
        sandbox_root,
        working_dir,
        argv,
        mounts,
        create_dirs,
        inner_uid,
        inner_gid,
        create_netns: matches.get_count("netns") > 0,
        host_name: matches
            .get_many::<String>("hostname")
            .and_then(|values| values.last())
            .cloned(),
        stdout_path,
        stderr_path,
        debug: matches.get_count("debug") > 0,
    })))
}

fn parse_sandbox_root(matches: &ArgMatches) -> Result<PathBuf> {
    let roots: Vec<&String> = matches
        .get_many::<String>("sandbox-root")
        .map(|values| values.collect())
        .unwrap_or_default();
    match roots.len() {
        0 => Err(usage_error("Sandbox root (-S) must be specified.")),
        1 => {
            let mut root = roots[0].clone();
            while root.len() > 1 && root.ends_with('/') {
                root.pop();
            }
            if !root.starts_with('/') {
                return Err(usage_error(
                    "The -S option must be used with absolute paths only.",
                ));
            }
            Ok(PathBuf::from(root))
        }
        _ => Err(usage_error(
            "Multiple sandbox roots (-S) specified, expected one.",
        )),
    }
}

fn parse_single_path(
    matches: &ArgMatches,
    id: &str,
    flag: char,
    what: &str,
) -> Result<Option<PathBuf>> {
    let values: Vec<&String> = matches
        .get_many::<String>(id)
        .map(|values| values.collect())
        .unwrap_or_default();
    match values.len() {
        0 => Ok(None),
        1 => {
            if !values[0].starts_with('/') {
                return Err(usage_error(format!(
                    "The -{} option must be used with absolute paths only.",
                    flag
                )));
            }
            Ok(Some(PathBuf::from(values[0])))
        }
        _ => Err(usage_error(format!(
            "Multiple {} (-{}) specified, expected at most one.",
            what, flag
        ))),
    }
}

fn parse_create_dirs(matches: &ArgMatches) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if let Some(values) = matches.get_many::<String>("create-dir") {
        for value in values {
            if !value.starts_with('/') {
                return Err(usage_error(
                    "The -d option must be used with absolute paths only.",
                ));
            }
            dirs.push(PathBuf::from(value));
        }
    }
    Ok(dirs)
}

fn parse_redirect(matches: &ArgMatches, id: &str) -> Result<Option<PathBuf>> {
    let values: Vec<&String> = matches
        .get_many::<String>(id)
        .map(|values| values.collect())
        .unwrap_or_default();
    match values.len() {
        0 => Ok(None),
        1 if values[0] == "-" => Ok(None),
        1 => Ok(Some(PathBuf::from(values[0]))),
        _ => Err(usage_error(format!(
            "Cannot redirect {} to more than one destination.",
            id
        ))),
    }
}

/// `-i` and `-r` both override the default nobody identity; when both
/// appear, the one given last wins.
fn parse_identity(matches: &ArgMatches) -> (u32, u32) {
    let caller = matches.indices_of("as-caller").and_then(|i| i.last());
    let root = matches.indices_of("as-root").and_then(|i| i.last());
    match (caller, root) {
        (Some(c), Some(r)) if c > r => caller_ids(),
        (Some(_), None) => caller_ids(),
        (None, Some(_)) | (Some(_), Some(_)) => (0, 0),
        (None, None) => (NOBODY_UID, NOBODY_GID),
    }
}

fn caller_ids() -> (u32, u32) {
    (unistd::getuid().as_raw(), unistd::getgid().as_raw())
}

enum MountToken<'a> {
    Source(&'a str),
    Target { path: &'a str, writable: bool },
}

/// Replays the `-M`/`-m`/`-w` occurrences in command line order and emits
/// completed mount entries eagerly. A source not followed by a target is
/// mounted read-only at its own path.
fn parse_mounts(matches: &ArgMatches) -> Result<Vec<Mount>> {
    let mut tokens: Vec<(usize, MountToken)> = Vec::new();
    collect_tokens(matches, "mount-source", &mut tokens, |path| {
        MountToken::Source(path)
    })?;
    collect_tokens(matches, "mount-target", &mut tokens, |path| {
        MountToken::Target {
            path,
            writable: false,
        }
    })?;
    collect_tokens(matches, "mount-target-rw", &mut tokens, |path| {
        MountToken::Target {
            path,
            writable: true,
        }
    })?;
    tokens.sort_by_key(|(idx, _)| *idx);

    let mut mounts = Vec::new();
    let mut pending: Option<&str> = None;
    for (_, token) in tokens {
        match token {
            MountToken::Source(source) => {
                if let Some(prev) = pending.take() {
                    mounts.push(Mount {
                        source: PathBuf::from(prev),
                        target: PathBuf::from(prev),
                        writable: false,
                    });
                }
                pending = Some(source);
            }
            MountToken::Target { path, writable } => {
                let source = pending.take().ok_or_else(|| {
                    usage_error(format!(
                        "The -{} option must be preceded by an -M option.",
                        if writable { 'w' } else { 'm' }
                    ))
                })?;
                mounts.push(Mount {
                    source: PathBuf::from(source),
                    target: PathBuf::from(path),
                    writable,
                });
            }
        }
    }
    if let Some(prev) = pending {
        mounts.push(Mount {
            source: PathBuf::from(prev),
            target: PathBuf::from(prev),
            writable: false,
        });
    }
    Ok(mounts)
}

fn collect_tokens<'a>(
    matches: &'a ArgMatches,
    id: &str,
    tokens: &mut Vec<(usize, MountToken<'a>)>,
    make: impl Fn(&'a str) -> MountToken<'a>,
) -> Result<()> {
    let flag = match id {
        "mount-source" => 'M',
        "mount-target" => 'm',
        _ => 'w',
    };
    if let (Some(indices), Some(values)) = (
        matches.indices_of(id),
        matches.get_many::<String>(id),
    ) {
        for (idx, value) in indices.zip(values) {
            if !value.starts_with('/') {
                return Err(usage_error(format!(
                    "The -{} option must be used with absolute paths only.",
                    flag
                )));
            }
            tokens.push((idx, make(value)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn args(argv: &[&str]) -> Vec<String> {
        argv.iter().map(|s| s.to_string()).collect()
    }

    fn parse_config(argv: &[&str]) -> Result<Config> {
        match parse(args(argv))? {
            Invocation::Run(config) => Ok(*config),
            Invocation::Probe => panic!("expected a run invocation"),
        }
    }

    #[test]
    fn test_probe_short_circuits() {
        // -C alone is valid even though -S and the command are missing.
        assert!(matches!(
            parse(args(&["nsbox", "-C"])).unwrap(),
            Invocation::Probe
        ));
    }

    #[test]
    fn test_minimal_invocation() {
        let config = parse_config(&["nsbox", "-S", "/tmp/sbx", "--", "/bin/true"]).unwrap();
        assert_eq!(config.sandbox_root, PathBuf::from("/tmp/sbx"));
        assert_eq!(config.argv, vec!["/bin/true"]);
        assert!(config.mounts.is_empty());
        assert!(!config.create_netns);
        assert!(!config.debug);
        assert_eq!((config.inner_uid, config.inner_gid), (NOBODY_UID, NOBODY_GID));
    }

    #[test]
    fn test_trailing_slash_stripped() {
        let config = parse_config(&["nsbox", "-S", "/tmp/sbx/", "--", "/bin/true"]).unwrap();
        assert_eq!(config.sandbox_root, PathBuf::from("/tmp/sbx"));
    }

    #[test]
    fn test_mount_state_machine() {
        let config = parse_config(&[
            "nsbox", "-S", "/sbx", "-M", "/bin", "-M", "/lib", "-w", "/scratch", "-M", "/usr",
            "-m", "/opt", "-M", "/etc", "--", "/bin/true",
        ])
        .unwrap();
        assert_eq!(
            config.mounts,
            vec![
                // -M followed by another -M: read-only at its own path.
                Mount {
                    source: "/bin".into(),
                    target: "/bin".into(),
                    writable: false
                },
                Mount {
                    source: "/lib".into(),
                    target: "/scratch".into(),
                    writable: true
                },
                Mount {
                    source: "/usr".into(),
                    target: "/opt".into(),
                    writable: false
                },
                // Pending source at end of parse is flushed read-only.
                Mount {
                    source: "/etc".into(),
                    target: "/etc".into(),
                    writable: false
                },
            ]
        );
    }

    #[test]
    fn test_target_without_source_rejected() {
        let err = parse_config(&["nsbox", "-S", "/sbx", "-m", "/bin", "--", "/bin/true"])
            .unwrap_err();
        assert!(err.to_string().contains("must be preceded by an -M"));
        let err = parse_config(&["nsbox", "-S", "/sbx", "-w", "/bin", "--", "/bin/true"])
            .unwrap_err();
        assert!(err.to_string().contains("must be preceded by an -M"));
    }

    #[test]
    fn test_relative_paths_rejected() {
        let err = parse_config(&["nsbox", "-S", "sbx", "--", "/bin/true"]).unwrap_err();
        assert!(err.to_string().contains("absolute paths only"));

        for flags in [
            ["-M", "bin"],
            ["-d", "var/cache"],
            ["-W", "work"],
            ["-m", "lib"],
            ["-w", "lib"],
        ] {
            let err = parse_config(&[
                "nsbox", "-S", "/sbx", "-M", "/lib", flags[0], flags[1], "--", "/bin/true",
            ])
            .unwrap_err();
            assert!(
                err.to_string().contains("absolute paths only"),
                "expected absolute-path error for {:?}, got: {err:#}",
                flags
            );
        }
    }

    #[test]
    fn test_multiple_sandbox_roots_rejected() {
        let err =
            parse_config(&["nsbox", "-S", "/a", "-S", "/b", "--", "/bin/true"]).unwrap_err();
        assert!(err.to_string().contains("Multiple sandbox roots"));
    }

    #[test]
    fn test_missing_sandbox_root_rejected() {
        let err = parse_config(&["nsbox", "--", "/bin/true"]).unwrap_err();
        assert!(err.to_string().contains("Sandbox root (-S)"));
    }

    #[test]
    fn test_missing_command_rejected() {
        let err = parse_config(&["nsbox", "-S", "/sbx"]).unwrap_err();
        assert!(err.to_string().contains("No command specified"));
    }

    #[test]
    fn test_identity_selection() {
        let nobody = parse_config(&["nsbox", "-S", "/sbx", "--", "/bin/true"]).unwrap();
        assert_eq!((nobody.inner_uid, nobody.inner_gid), (NOBODY_UID, NOBODY_GID));

        let root = parse_config(&["nsbox", "-S", "/sbx", "-r", "--", "/bin/true"]).unwrap();
        assert_eq!((root.inner_uid, root.inner_gid), (0, 0));

        let caller = parse_config(&["nsbox", "-S", "/sbx", "-i", "--", "/bin/true"]).unwrap();
        assert_eq!(caller.inner_uid, unistd::getuid().as_raw());
        assert_eq!(caller.inner_gid, unistd::getgid().as_raw());

        // The later of -i / -r wins.
        let last_r = parse_config(&["nsbox", "-S", "/sbx", "-i", "-r", "--", "/bin/true"]).unwrap();
        assert_eq!((last_r.inner_uid, last_r.inner_gid), (0, 0));
        let last_i = parse_config(&["nsbox", "-S", "/sbx", "-r", "-i", "--", "/bin/true"]).unwrap();
        assert_eq!(last_i.inner_uid, unistd::getuid().as_raw());
    }

    #[test]
    fn test_redirects() {
        let config = parse_config(&[
            "nsbox", "-S", "/sbx", "-l", "/tmp/out", "-L", "-", "--", "/bin/true",
        ])
        .unwrap();
        assert_eq!(config.stdout_path, Some(PathBuf::from("/tmp/out")));
        assert_eq!(config.stderr_path, None);

        let err = parse_config(&[
            "nsbox", "-S", "/sbx", "-l", "/a", "-l", "/b", "--", "/bin/true",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("more than one destination"));
    }

    #[test]
    fn test_misc_flags() {
        let config = parse_config(&[
            "nsbox", "-S", "/sbx", "-n", "-D", "-H", "mybox", "-W", "/work", "-d", "/var/cache",
            "-d", "/var/log", "--", "/bin/sh", "-c", "true",
        ])
        .unwrap();
        assert!(config.create_netns);
        assert!(config.debug);
        assert_eq!(config.host_name.as_deref(), Some("mybox"));
        assert_eq!(config.working_dir, Some(PathBuf::from("/work")));
        assert_eq!(
            config.create_dirs,
            vec![PathBuf::from("/var/cache"), PathBuf::from("/var/log")]
        );
        assert_eq!(config.argv, vec!["/bin/sh", "-c", "true"]);
    }

    #[test]
    fn test_expand_arg_files_in_place() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "-M\n/bin\n\n-M\n/lib").unwrap();
        let name = format!("@{}", file.path().display());

        let expanded = expand_arg_files(args(&["nsbox", "-S", "/sbx", &name, "--", "/bin/true"]))
            .unwrap();
        assert_eq!(
            expanded,
            args(&[
                "nsbox", "-S", "/sbx", "-M", "/bin", "-M", "/lib", "--", "/bin/true"
            ])
        );
    }

    #[test]
    fn test_expand_arg_files_nested() {
        let mut inner = tempfile::NamedTempFile::new().unwrap();
        writeln!(inner, "-M\n/lib").unwrap();
        let mut outer = tempfile::NamedTempFile::new().unwrap();
        writeln!(outer, "-M\n/bin\n@{}", inner.path().display()).unwrap();

        let name = format!("@{}", outer.path().display());
        let expanded = expand_arg_files(args(&["nsbox", &name])).unwrap();
        assert_eq!(expanded, args(&["nsbox", "-M", "/bin", "-M", "/lib"]));
    }

    #[test]
    fn test_expand_arg_files_leaves_command_untouched() {
        let expanded =
            expand_arg_files(args(&["nsbox", "-S", "/sbx", "--", "/bin/echo", "@hello"])).unwrap();
        assert_eq!(
            expanded,
            args(&["nsbox", "-S", "/sbx", "--", "/bin/echo", "@hello"])
        );
    }

    #[test]
    fn test_expand_arg_files_skips_option_values() {
        // An option value that happens to start with @ is not a file
        // argument.
        let expanded =
            expand_arg_files(args(&["nsbox", "-H", "@host", "-S", "/sbx"])).unwrap();
        assert_eq!(expanded, args(&["nsbox", "-H", "@host", "-S", "/sbx"]));
    }

    #[test]
    fn test_expand_arg_files_missing_file() {
        let err = expand_arg_files(args(&["nsbox", "@/no/such/file"])).unwrap_err();
        assert!(err.to_string().contains("argument file"));
    }

    #[test]
    fn test_argfile_parses_into_mounts() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "-M\n/bin\n-M\n/lib\n-w\n/scratch").unwrap();
        let name = format!("@{}", file.path().display());

        let config = parse_config(&["nsbox", "-S", "/sbx", &name, "--", "/bin/true"]).unwrap();
        assert_eq!(
            config.mounts,
            vec![
                Mount {
                    source: "/bin".into(),
                    target: "/bin".into(),
                    writable: false
                },
                Mount {
                    source: "/lib".into(),
                    target: "/scratch".into(),
                    writable: true
                },
            ]
        );
    }
}
