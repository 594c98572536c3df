use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use crate::response::{CliResponse, RawOutput, ResponseKind};
use crate::transport::Transport;

/// Sentinel tag planted after a failing command so the parser can read the
/// return code back in-band. A fixed hex literal that will not collide with
/// remote output.
pub const ERROR_TAG: &str = "errorf7e3a9c145b84d20a6c3519e8b72d4f0";

/// Suffix alphabet for resolving canonical-name conflicts.
const KEY_STR: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Maximum length of a canonical name.
const MAX_NAME_LEN: usize = 50;

/// Vendor return code meaning the metadata service is transiently busy.
pub const METADATA_RC_BUSY: i32 = 11;

/// Total send attempts for a metadata-busy response.
const RETRY_ATTEMPTS: u32 = 3;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Reserved argument-key prefix for engine meta-options.
pub const META_PREFIX: &str = "xsf.";

/// Reserved argument key carrying input piped to the remote process.
pub const STDIN_KEY: &str = "stdin";

// -- Caller arguments ----------------------------------------------------------

/// A value supplied for a command argument or meta-option.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ArgValue {
    /// The value as it is emitted on the wire.
    pub fn to_arg_string(&self) -> String {
        match self {
            ArgValue::Str(s) => s.clone(),
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Float(x) => x.to_string(),
        }
    }

    fn as_bool(&self) -> Result<bool> {
        match self {
            ArgValue::Bool(b) => Ok(*b),
            ArgValue::Str(s) if s == "true" => Ok(true),
            ArgValue::Str(s) if s == "false" => Ok(false),
            other => Err(AgentError::Spec(format!(
                "\"{}\" is not boolean.",
                other.to_arg_string()
            ))),
        }
    }

    fn as_f64(&self) -> Result<f64> {
        match self {
            ArgValue::Int(i) => Ok(*i as f64),
            ArgValue::Float(x) => Ok(*x),
            ArgValue::Str(s) => s.parse::<f64>().map_err(|_| {
                AgentError::Spec(format!("\"{s}\" is not a number."))
            }),
            ArgValue::Bool(b) => Err(AgentError::Spec(format!("\"{b}\" is not a number."))),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        ArgValue::Str(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        ArgValue::Str(s)
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        ArgValue::Bool(b)
    }
}

impl From<i64> for ArgValue {
    fn from(i: i64) -> Self {
        ArgValue::Int(i)
    }
}

impl From<f64> for ArgValue {
    fn from(x: f64) -> Self {
        ArgValue::Float(x)
    }
}

/// Named arguments for one command invocation.
///
/// Keys with the `xsf.` prefix are meta-options consumed by the engine;
/// `stdin` is reserved for input piped to the remote process; every other
/// key must be declared by the command.
#[derive(Debug, Clone, Default)]
pub struct Args {
    entries: IndexMap<String, ArgValue>,
}

impl Args {
    pub fn new() -> Self {
        Args::default()
    }

    /// Builder-style insert.
    pub fn arg(mut self, key: &str, value: impl Into<ArgValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<ArgValue>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.entries.iter()
    }

    fn stdin(&self) -> Option<String> {
        self.entries.get(STDIN_KEY).map(ArgValue::to_arg_string)
    }
}

// -- Meta-options --------------------------------------------------------------

/// Engine options extracted from `xsf.`-prefixed argument keys.
#[derive(Debug, Clone)]
pub struct MetaOptions {
    /// Append the return-code sentinel tail and check it while parsing.
    pub check_return_code: bool,
    /// Quote argument values containing non-alphanumeric characters.
    pub escape: bool,
    /// Output field delimiter (parser hint).
    pub delim: Option<char>,
    /// Do not reject unknown caller keys and do not raise on malformed
    /// output.
    pub flexible: bool,
    /// Per-call transport timeout.
    pub timeout: Option<Duration>,
    /// Override header auto-detection of tabular output.
    pub with_header: Option<bool>,
    /// The sentinel the parser scans stdout for.
    pub error_tag: Option<String>,
}

impl Default for MetaOptions {
    fn default() -> Self {
        MetaOptions {
            check_return_code: true,
            escape: true,
            delim: None,
            flexible: false,
            timeout: None,
            with_header: None,
            error_tag: None,
        }
    }
}

impl MetaOptions {
    /// Extract the meta-options from the caller's argument map.
    pub fn from_args(args: &Args) -> Result<MetaOptions> {
        let mut meta = MetaOptions::default();
        for (key, value) in args.iter() {
            let Some(name) = key.strip_prefix(META_PREFIX) else {
                continue;
            };
            match name {
                "check_return_code" => meta.check_return_code = value.as_bool()?,
                "escape" => meta.escape = value.as_bool()?,
                "delim" => meta.delim = value.to_arg_string().chars().next(),
                "flexible" => meta.flexible = value.as_bool()?,
                "timeout" => meta.timeout = Some(Duration::from_secs_f64(value.as_f64()?)),
                "with_header" => meta.with_header = Some(value.as_bool()?),
                _ => {}
            }
        }
        Ok(meta)
    }
}

// -- Parameters ----------------------------------------------------------------

/// One declared command parameter.
#[derive(Debug, Clone)]
pub struct Param {
    /// Caller-facing key.
    pub name: String,
    /// Name as emitted on the wire, e.g. `-filtervalue`.
    pub real_name: String,
    /// Emit the real name?
    pub with_name: bool,
    /// Emit a value after it?
    pub with_value: bool,
    pub required: bool,
    /// Closed set of allowed values; empty means unconstrained.
    pub options: Vec<String>,
    pub description: String,
}

impl Param {
    /// Emit this parameter's wire tokens for the supplied arguments.
    fn emit(&self, args: &Args, escape: bool) -> Result<Vec<String>> {
        let Some(value) = args.get(&self.name) else {
            if self.required {
                return Err(AgentError::Spec(format!(
                    "The parameter \"{}\" is missing.",
                    self.name
                )));
            }
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        if self.with_name {
            out.push(self.real_name.clone());
        }
        if self.with_value {
            let v = value.to_arg_string();
            if !self.options.is_empty() && !self.options.contains(&v) {
                return Err(AgentError::Spec(format!(
                    "The value of parameter \"{}\" should be one of {:?}.",
                    self.name, self.options
                )));
            }
            out.push(if escape { escape_shell_arg(&v) } else { v });
        }
        Ok(out)
    }
}

/// How ParamChoice exclusivity is treated at invocation time.
///
/// The constraint has historically been documentation-only; enforcement is
/// available as an opt-in policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChoicePolicy {
    #[default]
    DocumentationOnly,
    Enforced,
}

/// A set of parameters of which at most one may appear; `required` means
/// exactly one must.
#[derive(Debug, Clone)]
pub struct ParamChoice {
    /// Canonical names of the member parameters.
    pub params: Vec<String>,
    pub required: bool,
}

impl ParamChoice {
    fn check(&self, args: &Args, policy: ChoicePolicy) -> Result<()> {
        if policy == ChoicePolicy::DocumentationOnly {
            return Ok(());
        }
        let supplied = self
            .params
            .iter()
            .filter(|name| args.get(name).is_some())
            .count();
        if supplied > 1 || (supplied == 0 && self.required) {
            return Err(AgentError::Spec(format!(
                "Only one of parameters {:?} can be specified.",
                self.params
            )));
        }
        Ok(())
    }
}

// -- Commands ------------------------------------------------------------------

/// SVC-flavored commands order positional arguments last and receive
/// automatic `-delim ,` / `-nohdr` treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFlavor {
    Generic,
    Svc,
}

/// The result of one command invocation: structured records when the spec
/// declared a response shape, raw output otherwise.
#[derive(Debug, Clone)]
pub enum CommandOutput {
    Parsed(CliResponse),
    Raw(RawOutput),
}

impl CommandOutput {
    pub fn response(&self) -> Option<&CliResponse> {
        match self {
            CommandOutput::Parsed(resp) => Some(resp),
            CommandOutput::Raw(_) => None,
        }
    }

    pub fn into_response(self) -> Option<CliResponse> {
        match self {
            CommandOutput::Parsed(resp) => Some(resp),
            CommandOutput::Raw(_) => None,
        }
    }

    pub fn raw(&self) -> &RawOutput {
        match self {
            CommandOutput::Parsed(resp) => &resp.raw,
            CommandOutput::Raw(raw) => raw,
        }
    }
}

/// An executable CLI command, or an executable namespace holding nested
/// commands (a namespace with direct parameters is itself callable).
#[derive(Debug, Clone)]
pub struct Command {
    /// Canonical lookup name.
    pub name: String,
    /// The command string to emit; nested commands carry their namespace
    /// prefix, e.g. `svcinfo lscluster`.
    pub real_name: String,
    pub description: String,
    pub flavor: CommandFlavor,
    pub response: Option<ResponseKind>,
    pub choice_policy: ChoicePolicy,
    params: IndexMap<String, Param>,
    choices: Vec<ParamChoice>,
    subcommands: IndexMap<String, Command>,
}

impl Command {
    pub(crate) fn new(
        real_name: &str,
        description: &str,
        response: Option<ResponseKind>,
        choice_policy: ChoicePolicy,
    ) -> Command {
        let flavor = if response.is_some() {
            CommandFlavor::Svc
        } else {
            CommandFlavor::Generic
        };
        Command {
            name: String::new(),
            real_name: real_name.to_string(),
            description: description.to_string(),
            flavor,
            response,
            choice_policy,
            params: IndexMap::new(),
            choices: Vec::new(),
            subcommands: IndexMap::new(),
        }
    }

    /// Register a nested command; its wire name is prefixed with this
    /// command's own.
    pub(crate) fn add_subcommand(
        &mut self,
        real_name: &str,
        description: &str,
        response: Option<ResponseKind>,
    ) -> Result<&mut Command> {
        let real_name = strip_name(real_name)?;
        let response = response.or(self.response);
        let mut cmd = Command::new(
            &format!("{} {}", self.real_name, real_name),
            description,
            response,
            self.choice_policy,
        );
        cmd.name = resolve_key_conflict(&self.subcommands, &canonical_name(&real_name, Some('_'))?)?;
        let name = cmd.name.clone();
        Ok(self.subcommands.entry(name).or_insert(cmd))
    }

    pub(crate) fn add_param(
        &mut self,
        real_name: &str,
        with_name: bool,
        with_value: bool,
        required: bool,
        description: &str,
        options: Vec<String>,
    ) -> Result<&Param> {
        let real_name = strip_name(real_name)?;
        let name = resolve_key_conflict(&self.params, &canonical_name(&real_name, None)?)?;
        let param = Param {
            name: name.clone(),
            real_name,
            with_name,
            with_value,
            required,
            options,
            description: description.to_string(),
        };
        Ok(self.params.entry(name).or_insert(param))
    }

    pub(crate) fn add_param_choice(&mut self, params: Vec<String>, required: bool) -> Result<()> {
        if params.is_empty() {
            return Err(AgentError::Spec(
                "ParamChoice should have at least one child element.".to_string(),
            ));
        }
        self.choices.push(ParamChoice { params, required });
        Ok(())
    }

    pub(crate) fn set_param_required(&mut self, name: &str, required: bool) {
        if let Some(param) = self.params.get_mut(name) {
            param.required = required;
        }
    }

    pub fn params(&self) -> impl Iterator<Item = &Param> {
        self.params.values()
    }

    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.get(name)
    }

    pub fn choices(&self) -> &[ParamChoice] {
        &self.choices
    }

    pub fn subcommands(&self) -> impl Iterator<Item = &Command> {
        self.subcommands.values()
    }

    pub fn subcommand(&self, name: &str) -> Option<&Command> {
        self.subcommands.get(name)
    }

    pub fn has_subcommands(&self) -> bool {
        !self.subcommands.is_empty()
    }

    /// Marshal the caller's arguments into the full command line, updating
    /// the parser hints in `meta` along the way.
    ///
    /// Parameters are emitted and validated before unknown caller keys are
    /// rejected, so a missing required parameter wins over an unsupported
    /// key.
    pub fn build_command_line(&self, args: &Args, meta: &mut MetaOptions) -> Result<String> {
        let mut parts = vec![self.real_name.clone()];
        match self.flavor {
            CommandFlavor::Generic => {
                for param in self.params.values() {
                    parts.extend(param.emit(args, meta.escape)?);
                }
            }
            CommandFlavor::Svc => {
                // Positional arguments go last; -delim is forced to a comma
                // and -nohdr is dropped to keep headers parsable.
                let mut positional = Vec::new();
                for param in self.params.values() {
                    if param.real_name == "-delim" {
                        parts.push("-delim ,".to_string());
                        meta.delim = Some(',');
                    } else if param.real_name == "-nohdr" {
                        continue;
                    } else if param.with_name {
                        parts.extend(param.emit(args, meta.escape)?);
                    } else {
                        positional.extend(param.emit(args, meta.escape)?);
                    }
                }
                parts.extend(positional);
            }
        }
        for choice in &self.choices {
            choice.check(args, self.choice_policy)?;
        }

        if !meta.flexible {
            for key in args.keys() {
                if !key.starts_with(META_PREFIX)
                    && key != STDIN_KEY
                    && !self.params.contains_key(key)
                {
                    return Err(AgentError::Spec(format!(
                        "The parameter \"{key}\" is not supported."
                    )));
                }
            }
        }

        if meta.check_return_code {
            parts.push(format!("|| echo {ERROR_TAG} $?"));
            meta.error_tag = Some(ERROR_TAG.to_string());
        }
        Ok(parts.join(" "))
    }

    /// Execute the command over the transport.
    ///
    /// A metadata-busy failure (return code 11) is retried up to three
    /// total attempts, one second apart; every other failure propagates
    /// immediately.
    pub async fn invoke(&self, transport: &mut dyn Transport, args: &Args) -> Result<CommandOutput> {
        let mut meta = MetaOptions::from_args(args)?;
        let command_line = self.build_command_line(args, &mut meta)?;
        let stdin = args.stdin();

        let mut attempt = 1;
        loop {
            debug!(command = %command_line, "sending CLI command");
            let raw = transport
                .send_command(&command_line, meta.timeout, stdin.as_deref())
                .await?;
            let outcome = match self.response {
                Some(kind) => CliResponse::parse(kind, raw, &meta).map(CommandOutput::Parsed),
                None => Ok(CommandOutput::Raw(raw)),
            };
            match outcome {
                Ok(output) => return Ok(output),
                Err(err)
                    if err.return_code() == Some(METADATA_RC_BUSY)
                        && attempt < RETRY_ATTEMPTS =>
                {
                    attempt += 1;
                    warn!(attempt, "metadata service busy, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// -- Registry ------------------------------------------------------------------

/// The parsed command registry of one array. Constructed during the
/// connection handshake and immutable thereafter.
#[derive(Debug, Clone, Default)]
pub struct CliSpec {
    /// e.g. "svc"
    pub array_type: String,
    /// (type, version) pairs advertised by the array.
    pub array_infos: Vec<(String, String)>,
    /// Declared error-code prefixes.
    pub error_prefixes: Vec<String>,
    executables: IndexMap<String, Command>,
}

impl CliSpec {
    pub(crate) fn new() -> CliSpec {
        CliSpec::default()
    }

    pub(crate) fn add_executable(
        &mut self,
        real_name: &str,
        description: &str,
        response: Option<ResponseKind>,
        choice_policy: ChoicePolicy,
    ) -> Result<&mut Command> {
        let real_name = strip_name(real_name)?;
        let mut cmd = Command::new(&real_name, description, response, choice_policy);
        cmd.name = resolve_key_conflict(&self.executables, &canonical_name(&real_name, Some('_'))?)?;
        let name = cmd.name.clone();
        Ok(self.executables.entry(name).or_insert(cmd))
    }

    /// Look up an executable namespace (or single-command executable).
    pub fn executable(&self, namespace: &str) -> Result<&Command> {
        self.executables.get(namespace).ok_or_else(|| {
            AgentError::Spec(format!("The executable \"{namespace}\" is not defined."))
        })
    }

    /// Look up a command handle by namespace and name.
    pub fn command(&self, namespace: &str, name: &str) -> Result<&Command> {
        let executable = self.executable(namespace)?;
        executable.subcommand(name).ok_or_else(|| {
            AgentError::Spec(format!(
                "The command \"{name}\" is not defined in \"{namespace}\"."
            ))
        })
    }

    pub fn executables(&self) -> impl Iterator<Item = &Command> {
        self.executables.values()
    }

    /// True when no executable carries any commands (treated as "no spec").
    pub fn has_commands(&self) -> bool {
        self.executables
            .values()
            .any(|e| e.has_subcommands() || e.params().next().is_some())
    }
}

// -- Name handling -------------------------------------------------------------

pub(crate) fn strip_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AgentError::Spec(
            "The name of Command or Executable or Param should not be empty.".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Canonicalize a wire name into a lookup key: ASCII-fold, truncate to 50
/// characters, then replace (commands) or drop (parameters) every
/// character outside `[A-Za-z0-9_]`, prefixing with `C` when the result
/// starts with an underscore or digit.
pub(crate) fn canonical_name(name: &str, replace: Option<char>) -> Result<String> {
    let truncated: String = name
        .chars()
        .map(|c| if c.is_ascii() { c } else { '?' })
        .take(MAX_NAME_LEN)
        .collect();
    let mut out = String::new();
    for c in truncated.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else if let Some(r) = replace {
            out.push(r);
        }
    }
    let Some(first) = out.chars().next() else {
        return Err(AgentError::Spec(format!(
            "The name \"{name}\" has no canonical form."
        )));
    };
    if first == '_' {
        Ok(format!("C{out}"))
    } else if first.is_ascii_digit() {
        Ok(format!("C_{out}"))
    } else {
        Ok(out)
    }
}

/// Resolve a canonical-name collision by appending `_` plus the next free
/// character of the fixed alphabet.
pub(crate) fn resolve_key_conflict<V>(existing: &IndexMap<String, V>, key: &str) -> Result<String> {
    if !existing.contains_key(key) {
        return Ok(key.to_string());
    }
    for suffix in KEY_STR.chars() {
        let candidate = format!("{key}_{suffix}");
        if !existing.contains_key(&candidate) {
            return Ok(candidate);
        }
    }
    Err(AgentError::Spec(format!(
        "Too many conflicts for the key \"{key}\"."
    )))
}

/// Quote a value containing non-alphanumeric characters, adding each quote
/// only if not already present.
pub(crate) fn escape_shell_arg(data: &str) -> String {
    if data.is_empty() || data.chars().all(char::is_alphanumeric) {
        return data.to_string();
    }
    let mut out = String::with_capacity(data.len() + 2);
    if !data.starts_with('\'') {
        out.push('\'');
    }
    out.push_str(data);
    if !data.ends_with('\'') {
        out.push('\'');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn svc_command(real_name: &str) -> Command {
        let mut cmd = Command::new(
            real_name,
            "",
            Some(ResponseKind::Generic),
            ChoicePolicy::default(),
        );
        cmd.name = "test".to_string();
        cmd
    }

    fn generic_command(real_name: &str) -> Command {
        let mut cmd = Command::new(real_name, "", None, ChoicePolicy::default());
        cmd.name = "test".to_string();
        cmd
    }

    #[test]
    fn canonical_name_rules() {
        assert_eq!(canonical_name("lscluster", Some('_')).unwrap(), "lscluster");
        assert_eq!(
            canonical_name("-filtervalue?", None).unwrap(),
            "filtervalue"
        );
        assert_eq!(
            canonical_name("-filtervalue?", Some('_')).unwrap(),
            "C_filtervalue_"
        );
        assert_eq!(canonical_name("9lives", None).unwrap(), "C_9lives");
        assert_eq!(canonical_name("has space", Some('_')).unwrap(), "has_space");
        let long = "x".repeat(80);
        assert_eq!(canonical_name(&long, Some('_')).unwrap().len(), MAX_NAME_LEN);
        assert!(canonical_name("---", None).is_err());
    }

    #[test]
    fn conflict_suffixes_follow_the_alphabet() {
        let mut map: IndexMap<String, ()> = IndexMap::new();
        assert_eq!(resolve_key_conflict(&map, "host").unwrap(), "host");
        map.insert("host".to_string(), ());
        assert_eq!(resolve_key_conflict(&map, "host").unwrap(), "host_0");
        map.insert("host_0".to_string(), ());
        assert_eq!(resolve_key_conflict(&map, "host").unwrap(), "host_1");
        for c in KEY_STR.chars() {
            map.insert(format!("host_{c}"), ());
        }
        assert!(resolve_key_conflict(&map, "host").is_err());
    }

    #[test]
    fn escape_is_idempotent() {
        for input in ["", "plain", "has space", "'quoted'", "a=b", "'half", "half'"] {
            let once = escape_shell_arg(input);
            let twice = escape_shell_arg(&once);
            assert_eq!(once, twice, "escaping {input:?} twice changed the output");
        }
        assert_eq!(escape_shell_arg("name=h1"), "'name=h1'");
        assert_eq!(escape_shell_arg("plain"), "plain");
    }

    #[test]
    fn generic_emission_follows_declaration_order() {
        let mut cmd = generic_command("lsdetail");
        cmd.add_param("cluster_id", false, true, true, "", vec![]).unwrap();
        cmd.add_param("-verbose", true, false, false, "", vec![]).unwrap();
        let args = Args::new().arg("cluster_id", "42").arg("verbose", "");
        let mut meta = MetaOptions::from_args(&args).unwrap();
        let line = cmd.build_command_line(&args, &mut meta).unwrap();
        assert_eq!(line, format!("lsdetail 42 -verbose || echo {ERROR_TAG} $?"));
        assert_eq!(meta.error_tag.as_deref(), Some(ERROR_TAG));
    }

    #[test]
    fn sentinel_suppressed_when_disabled() {
        let mut cmd = generic_command("lsdetail");
        cmd.add_param("-verbose", true, false, false, "", vec![]).unwrap();
        let args = Args::new().arg("xsf.check_return_code", false);
        let mut meta = MetaOptions::from_args(&args).unwrap();
        let line = cmd.build_command_line(&args, &mut meta).unwrap();
        assert_eq!(line, "lsdetail");
        assert!(meta.error_tag.is_none());
    }

    #[test]
    fn svc_emission_positional_last_with_delim() {
        let mut cmd = svc_command("svcinfo lscluster");
        cmd.add_param("-filtervalue", true, true, false, "", vec![]).unwrap();
        cmd.add_param("-nohdr", true, false, false, "", vec![]).unwrap();
        cmd.add_param("-delim", true, true, false, "", vec![]).unwrap();
        cmd.add_param("cluster_id_or_name", false, true, false, "", vec![]).unwrap();
        let args = Args::new()
            .arg("cluster_id_or_name", "c1")
            .arg("filtervalue", "name=x");
        let mut meta = MetaOptions::from_args(&args).unwrap();
        let line = cmd.build_command_line(&args, &mut meta).unwrap();
        assert_eq!(
            line,
            format!(
                "svcinfo lscluster -filtervalue 'name=x' -delim , c1 || echo {ERROR_TAG} $?"
            )
        );
        assert_eq!(meta.delim, Some(','));
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let mut cmd = svc_command("svctask mkhost");
        cmd.add_param("-name", true, true, true, "", vec![]).unwrap();
        let args = Args::new();
        let mut meta = MetaOptions::default();
        let err = cmd.build_command_line(&args, &mut meta).unwrap_err();
        assert!(err.to_string().contains("\"name\" is missing"));
    }

    #[test]
    fn value_outside_option_list_is_rejected() {
        let mut cmd = generic_command("chsetting");
        cmd.add_param(
            "-mode",
            true,
            true,
            false,
            "",
            vec!["on".to_string(), "off".to_string()],
        )
        .unwrap();
        let args = Args::new().arg("mode", "auto");
        let mut meta = MetaOptions::default();
        assert!(cmd.build_command_line(&args, &mut meta).is_err());

        let args = Args::new().arg("mode", "on");
        let mut meta = MetaOptions::default();
        assert!(cmd.build_command_line(&args, &mut meta).is_ok());
    }

    #[test]
    fn unknown_keys_rejected_unless_flexible() {
        let cmd = generic_command("lsdetail");
        let args = Args::new().arg("bogus", "1");
        let mut meta = MetaOptions::default();
        let err = cmd.build_command_line(&args, &mut meta).unwrap_err();
        assert_eq!(err.to_string(), "The parameter \"bogus\" is not supported.");

        let args = Args::new().arg("bogus", "1").arg("xsf.flexible", true);
        let mut meta = MetaOptions::from_args(&args).unwrap();
        assert!(cmd.build_command_line(&args, &mut meta).is_ok());
    }

    #[test]
    fn missing_required_parameter_wins_over_unknown_key() {
        let mut cmd = svc_command("svctask mkhost");
        cmd.add_param("-name", true, true, true, "", vec![]).unwrap();
        let args = Args::new().arg("bogus", "1");
        let mut meta = MetaOptions::default();
        let err = cmd.build_command_line(&args, &mut meta).unwrap_err();
        assert_eq!(err.to_string(), "The parameter \"name\" is missing.");
    }

    #[test]
    fn stdin_key_is_reserved_not_rejected() {
        let cmd = generic_command("mkmetadataentry");
        let args = Args::new()
            .arg("stdin", "payload")
            .arg("xsf.check_return_code", false);
        let mut meta = MetaOptions::from_args(&args).unwrap();
        assert_eq!(cmd.build_command_line(&args, &mut meta).unwrap(), "mkmetadataentry");
    }

    #[test]
    fn escaping_can_be_disabled() {
        let mut cmd = generic_command("echoarg");
        cmd.add_param("-value", true, true, false, "", vec![]).unwrap();
        let args = Args::new()
            .arg("value", "a b")
            .arg("xsf.escape", false)
            .arg("xsf.check_return_code", false);
        let mut meta = MetaOptions::from_args(&args).unwrap();
        assert_eq!(
            cmd.build_command_line(&args, &mut meta).unwrap(),
            "echoarg -value a b"
        );
    }

    #[test]
    fn choice_enforcement_is_opt_in() {
        let mut cmd = generic_command("lsdetail");
        cmd.add_param("-host", true, true, false, "", vec![]).unwrap();
        cmd.add_param("-cluster", true, true, false, "", vec![]).unwrap();
        cmd.add_param_choice(vec!["host".to_string(), "cluster".to_string()], true)
            .unwrap();

        // Documentation-only: both supplied passes.
        let args = Args::new().arg("host", "h").arg("cluster", "c");
        let mut meta = MetaOptions::default();
        assert!(cmd.build_command_line(&args, &mut meta).is_ok());

        // Enforced: both supplied fails, none supplied fails (required).
        cmd.choice_policy = ChoicePolicy::Enforced;
        let mut meta = MetaOptions::default();
        assert!(cmd.build_command_line(&args, &mut meta).is_err());
        let mut meta = MetaOptions::default();
        assert!(cmd.build_command_line(&Args::new(), &mut meta).is_err());
        let mut meta = MetaOptions::default();
        let args = Args::new().arg("host", "h");
        assert!(cmd.build_command_line(&args, &mut meta).is_ok());
    }

    #[test]
    fn registry_lookup_errors() {
        let mut spec = CliSpec::new();
        let exe = spec
            .add_executable("svcinfo", "", Some(ResponseKind::Generic), ChoicePolicy::default())
            .unwrap();
        exe.add_subcommand("lshost", "", None).unwrap();

        assert!(spec.command("svcinfo", "lshost").is_ok());
        assert!(spec.command("svcinfo", "nothere").is_err());
        assert!(spec.command("nothere", "lshost").is_err());
    }

    #[test]
    fn nested_commands_inherit_prefix_and_response() {
        let mut spec = CliSpec::new();
        let exe = spec
            .add_executable("svcinfo", "", Some(ResponseKind::Generic), ChoicePolicy::default())
            .unwrap();
        let sub = exe.add_subcommand("lscluster", "", None).unwrap();
        assert_eq!(sub.real_name, "svcinfo lscluster");
        assert_eq!(sub.response, Some(ResponseKind::Generic));
        assert_eq!(sub.flavor, CommandFlavor::Svc);
    }

    // -- Invocation over a fake transport -------------------------------------

    struct ScriptedTransport {
        sends: Arc<AtomicUsize>,
        outputs: Vec<RawOutput>,
        sent: Vec<String>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&mut self) -> crate::error::Result<()> {
            Ok(())
        }

        async fn send_command(
            &mut self,
            command: &str,
            _timeout: Option<Duration>,
            _stdin: Option<&str>,
        ) -> crate::error::Result<RawOutput> {
            self.sent.push(command.to_string());
            let n = self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .outputs
                .get(n)
                .or_else(|| self.outputs.last())
                .cloned()
                .unwrap_or_default())
        }

        async fn disconnect(&mut self) {}

        fn is_connected(&self) -> bool {
            true
        }

        fn is_active(&self) -> bool {
            true
        }

        fn endpoint(&self) -> String {
            "fake".to_string()
        }
    }

    fn busy_output() -> RawOutput {
        RawOutput::new(format!("{ERROR_TAG} {METADATA_RC_BUSY}"), "CMMVC6072W busy\n")
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_busy_is_retried_three_times() {
        let sends = Arc::new(AtomicUsize::new(0));
        let mut transport = ScriptedTransport {
            sends: sends.clone(),
            outputs: vec![busy_output()],
            sent: Vec::new(),
        };
        let cmd = svc_command("svctask mkmetadata");
        let start = Instant::now();
        let err = cmd.invoke(&mut transport, &Args::new()).await.unwrap_err();
        assert_eq!(err.return_code(), Some(METADATA_RC_BUSY));
        assert_eq!(sends.load(Ordering::SeqCst), 3);
        // Two sleeps of one second separate the three attempts.
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_then_success_stops_retrying() {
        let sends = Arc::new(AtomicUsize::new(0));
        let mut transport = ScriptedTransport {
            sends: sends.clone(),
            outputs: vec![busy_output(), RawOutput::new("id,name\n0,h1\n", "")],
            sent: Vec::new(),
        };
        let cmd = svc_command("svcinfo lshost");
        let output = cmd.invoke(&mut transport, &Args::new()).await.unwrap();
        assert_eq!(sends.load(Ordering::SeqCst), 2);
        assert_eq!(output.response().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn other_failure_codes_fail_fast() {
        let sends = Arc::new(AtomicUsize::new(0));
        let mut transport = ScriptedTransport {
            sends: sends.clone(),
            outputs: vec![RawOutput::new(
                format!("{ERROR_TAG} 1"),
                "CMMVC5804E no such object\n",
            )],
            sent: Vec::new(),
        };
        let cmd = svc_command("svcinfo lshost");
        let err = cmd.invoke(&mut transport, &Args::new()).await.unwrap_err();
        assert_eq!(err.return_code(), Some(1));
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn commands_without_response_return_raw() {
        let mut transport = ScriptedTransport {
            sends: Arc::new(AtomicUsize::new(0)),
            outputs: vec![RawOutput::new("anything goes", "")],
            sent: Vec::new(),
        };
        let cmd = generic_command("catxmlspec");
        let args = Args::new().arg("xsf.check_return_code", false);
        let output = cmd.invoke(&mut transport, &args).await.unwrap();
        assert!(output.response().is_none());
        assert_eq!(output.raw().stdout, "anything goes");
        assert_eq!(transport.sent, ["catxmlspec"]);
    }
}
