use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use base64::Engine;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{error, warn};

use crate::clispec::{ChoicePolicy, CliSpec, Command};
use crate::error::{AgentError, Result};
use crate::response::{find_response_kind, ResponseKind};

/// The only specification schema version this parser understands.
const SUPPORTED_VERSION: &str = "2.0";

/// Options for parsing a CLI specification document.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Swallow per-node errors and log them, possibly yielding a partial
    /// registry.
    pub flexible: bool,
    /// How ParamChoice exclusivity behaves at invocation time.
    pub choice_policy: ChoicePolicy,
}

/// Parse a CLI specification XML document.
pub fn parse(source: &str) -> Result<CliSpec> {
    parse_with_options(source, ParseOptions::default())
}

/// Parse a CLI specification XML document with explicit options.
pub fn parse_with_options(source: &str, options: ParseOptions) -> Result<CliSpec> {
    let root = load_xml(source)?;
    match root.attr("version") {
        Some(SUPPORTED_VERSION) => {}
        other => {
            if options.flexible {
                error!(
                    version = other.unwrap_or("<missing>"),
                    "the CLI spec version is not supported, continuing in flexible mode"
                );
            } else {
                return Err(AgentError::Spec(format!(
                    "The CLI spec {} is not supported.",
                    other.unwrap_or("<missing>")
                )));
            }
        }
    }
    parse_spec_tree(&root, options)
}

/// Parse a CLI specification from a file on disk.
pub fn parse_file(path: &Path, options: ParseOptions) -> Result<CliSpec> {
    let source = std::fs::read_to_string(path)?;
    parse_with_options(&source, options)
}

// -- Document model ------------------------------------------------------------

/// A minimal owned XML element, loaded eagerly so the spec tree can be
/// walked recursively (and a decoded `CompressedCommands` subtree can be
/// spliced in).
#[derive(Debug, Clone, Default)]
struct Element {
    tag: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(entry) = self.attrs.iter_mut().find(|(k, _)| k == name) {
            entry.1 = value.to_string();
        } else {
            self.attrs.push((name.to_string(), value.to_string()));
        }
    }

    fn children_with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.tag == tag)
    }
}

fn invalid_xml(detail: impl std::fmt::Display) -> AgentError {
    AgentError::Spec(format!("The CLI spec is not valid XML. ({detail})"))
}

fn element_from(start: &BytesStart<'_>) -> Result<Element> {
    let mut element = Element {
        tag: String::from_utf8_lossy(start.name().as_ref()).to_string(),
        ..Element::default()
    };
    for attr in start.attributes() {
        let attr = attr.map_err(invalid_xml)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value().map_err(invalid_xml)?.to_string();
        element.attrs.push((key, value));
    }
    Ok(element)
}

fn load_xml(source: &str) -> Result<Element> {
    let mut reader = Reader::from_str(source);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(element_from(&e)?),
            Ok(Event::Empty(e)) => {
                let element = element_from(&e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(_)) => {
                let element = stack.pop().ok_or_else(|| invalid_xml("unbalanced end tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(t)) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&t.unescape().map_err(invalid_xml)?);
                }
            }
            Ok(Event::CData(t)) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(invalid_xml(e)),
        }
    }
    if !stack.is_empty() {
        return Err(invalid_xml("unclosed element"));
    }
    root.ok_or_else(|| invalid_xml("no root element"))
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    } else {
        return Err(invalid_xml("multiple root elements"));
    }
    Ok(())
}

// -- Specification walk --------------------------------------------------------

/// Soften a per-node failure in flexible mode: log and skip the node.
fn soften<T>(options: ParseOptions, tag: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            if options.flexible {
                warn!(node = tag, error = %err, "continuing in flexible mode");
                Ok(None)
            } else {
                Err(err)
            }
        }
    }
}

fn die(options: ParseOptions, msg: &str) -> Result<()> {
    if options.flexible {
        error!("continuing in flexible mode: {msg}");
        Ok(())
    } else {
        Err(AgentError::Spec(msg.to_string()))
    }
}

fn parse_spec_tree(root: &Element, options: ParseOptions) -> Result<CliSpec> {
    if root.tag != "ArraySyntax" {
        return Err(AgentError::Spec("ArraySyntax is missing.".to_string()));
    }
    let mut spec = CliSpec::new();
    // ArrayType and Errors are read once; repeats are ignored.
    let mut seen: HashSet<&str> = HashSet::new();
    for child in &root.children {
        match child.tag.as_str() {
            "ArrayType" if seen.insert("ArrayType") => {
                soften(options, "ArrayType", parse_array_type(&mut spec, child))?;
            }
            "Errors" if seen.insert("Errors") => {
                soften(options, "Errors", parse_errors(&mut spec, child))?;
            }
            "Commands" => {
                soften(options, "Commands", parse_commands(&mut spec, child, options))?;
            }
            "CompressedCommands" => {
                soften(
                    options,
                    "CompressedCommands",
                    parse_compressed_commands(&mut spec, child, options),
                )?;
            }
            _ => {}
        }
    }
    if spec.array_type.is_empty() || spec.array_infos.is_empty() || spec.error_prefixes.is_empty() {
        die(options, "Some meta-data is missing.")?;
    }
    Ok(spec)
}

fn parse_array_type(spec: &mut CliSpec, nd: &Element) -> Result<()> {
    let array_type = nd
        .attr("type")
        .ok_or_else(|| AgentError::Spec("Bad ArrayType".to_string()))?;
    spec.array_type = array_type.trim().to_string();
    for version in nd.children_with_tag("ArrayVersion") {
        let ty = version
            .attr("type")
            .ok_or_else(|| AgentError::Spec("Bad ArrayVersion".to_string()))?;
        let ver = version
            .attr("version")
            .ok_or_else(|| AgentError::Spec("Bad ArrayVersion".to_string()))?;
        spec.array_infos
            .push((ty.trim().to_string(), ver.trim().to_string()));
    }
    Ok(())
}

fn parse_errors(spec: &mut CliSpec, nd: &Element) -> Result<()> {
    spec.error_prefixes = text_list(nd, "Error");
    Ok(())
}

fn parse_commands(spec: &mut CliSpec, nd: &Element, options: ParseOptions) -> Result<()> {
    let default_response = parse_response(nd);
    let names: Vec<String> = nd
        .attr("implements")
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect();
    for executable in nd.children_with_tag("Executable") {
        soften(
            options,
            "Executable",
            parse_executable(spec, executable, default_response, &names, options),
        )?;
    }
    Ok(())
}

fn parse_compressed_commands(
    spec: &mut CliSpec,
    nd: &Element,
    options: ParseOptions,
) -> Result<()> {
    let text = nd.text.trim();
    if text.is_empty()
        || nd.attr("compression") != Some("zlib")
        || nd.attr("encoding") != Some("base64")
    {
        return Err(AgentError::UnsupportedXmlCompression(
            "CompressedCommands format is not supported.".to_string(),
        ));
    }
    let decoded = extract_compressed(text)?;
    let mut inner = load_xml(&decoded)?;
    if inner.tag != "Commands" {
        return Err(AgentError::Spec(format!(
            "Bad {} within CompressedCommands",
            inner.tag
        )));
    }
    if let Some(implements) = nd.attr("implements") {
        inner.set_attr("implements", implements);
    }
    parse_commands(spec, &inner, options)
}

/// Decode a zlib+base64 payload back into the XML text it carries.
fn extract_compressed(text: &str) -> Result<String> {
    let stripped: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(stripped.as_bytes())
        .map_err(|e| AgentError::Spec(format!("Bad CompressedCommands encoding: {e}")))?;
    let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(|e| AgentError::Spec(format!("Bad CompressedCommands payload: {e}")))?;
    Ok(out)
}

fn parse_executable(
    spec: &mut CliSpec,
    nd: &Element,
    default_response: Option<ResponseKind>,
    names: &[String],
    options: ParseOptions,
) -> Result<()> {
    let name = nd.attr("name").unwrap_or("");
    if !names.is_empty() && !names.iter().any(|n| n == name.trim()) {
        return Ok(());
    }
    let response = parse_response(nd).or(default_response);
    let executable = spec.add_executable(
        name,
        nd.attr("description").unwrap_or(""),
        response,
        options.choice_policy,
    )?;

    // Nested Command elements and direct param elements are mutually
    // exclusive shapes; the first child seen locks the shape.
    let mut commands_shape: Option<bool> = None;
    for child in &nd.children {
        match child.tag.as_str() {
            "Command" if commands_shape != Some(false) => {
                commands_shape = Some(true);
                soften(options, "Command", parse_command(executable, child, options))?;
            }
            "ValueParam" | "FlagParam" | "ParamChoice" if commands_shape != Some(true) => {
                commands_shape = Some(false);
                parse_param_child(executable, child, options)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_command(parent: &mut Command, nd: &Element, options: ParseOptions) -> Result<()> {
    let response = parse_response(nd);
    let command = parent.add_subcommand(
        nd.attr("name").unwrap_or(""),
        nd.attr("description").unwrap_or(""),
        response,
    )?;
    for child in &nd.children {
        if matches!(child.tag.as_str(), "ValueParam" | "FlagParam" | "ParamChoice") {
            parse_param_child(command, child, options)?;
        }
    }
    Ok(())
}

fn parse_param_child(command: &mut Command, nd: &Element, options: ParseOptions) -> Result<()> {
    match nd.tag.as_str() {
        "ValueParam" => {
            soften(options, "ValueParam", parse_value_param(command, nd))?;
        }
        "FlagParam" => {
            soften(options, "FlagParam", parse_flag_param(command, nd))?;
        }
        "ParamChoice" => {
            soften(options, "ParamChoice", parse_param_choice(command, nd, options))?;
        }
        _ => {}
    }
    Ok(())
}

fn parse_value_param(command: &mut Command, nd: &Element) -> Result<String> {
    let with_name = !to_bool(nd.attr("noName").unwrap_or("false"))?;
    let required = to_bool(nd.attr("required").unwrap_or("false"))?;
    let param = command.add_param(
        nd.attr("name").unwrap_or(""),
        with_name,
        true,
        required,
        nd.attr("description").unwrap_or(""),
        text_list(nd, "Option"),
    )?;
    Ok(param.name.clone())
}

fn parse_flag_param(command: &mut Command, nd: &Element) -> Result<String> {
    let required = to_bool(nd.attr("required").unwrap_or("false"))?;
    let param = command.add_param(
        nd.attr("name").unwrap_or(""),
        true,
        false,
        required,
        nd.attr("description").unwrap_or(""),
        Vec::new(),
    )?;
    Ok(param.name.clone())
}

fn parse_param_choice(command: &mut Command, nd: &Element, options: ParseOptions) -> Result<()> {
    let mut members = Vec::new();
    let mut ok = true;
    for child in &nd.children {
        let parsed = match child.tag.as_str() {
            "ValueParam" => soften(options, "ValueParam", parse_value_param(command, child))?,
            "FlagParam" => soften(options, "FlagParam", parse_flag_param(command, child))?,
            _ => continue,
        };
        match parsed {
            Some(name) => {
                // ParamChoice members are individually optional.
                command.set_param_required(&name, false);
                members.push(name);
            }
            None => ok = false,
        }
    }
    if ok {
        command.add_param_choice(members, to_bool(nd.attr("required").unwrap_or("false"))?)?;
    }
    Ok(())
}

/// Read the response-parser selector from a node's first child.
///
/// `Response` is always the first child or does not appear. For a
/// `Command` node the owning command's name sub-selects the parser;
/// elsewhere the `param` attribute of the `Response` node does.
fn parse_response(parent: &Element) -> Option<ResponseKind> {
    let first = parent.children.first()?;
    if first.tag != "Response" {
        return None;
    }
    let param = if parent.tag == "Command" {
        parent.attr("name")
    } else {
        first.attr("param")
    };
    find_response_kind(first.attr("type"), param.filter(|p| !p.is_empty()))
}

fn to_bool(value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(AgentError::Spec(format!("\"{other}\" is not boolean."))),
    }
}

fn text_list(nd: &Element, tag: &str) -> Vec<String> {
    nd.children_with_tag(tag)
        .map(|c| c.text.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}
