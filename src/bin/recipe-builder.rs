use clap::Parser;
use recipe_builder::machine::{Fakemachine, HostOnly, MachineBackend};
use recipe_builder::session::{self, SessionOptions};
use recipe_builder::Outcome;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Build an operating system image from a recipe.
#[derive(Parser, Debug)]
#[command(name = "recipe-builder", version)]
struct Cli {
    /// Recipe file to build.
    recipe: PathBuf,

    /// Directory receiving build artifacts [default: current directory].
    #[arg(long, value_name = "DIR")]
    artifactdir: Option<PathBuf>,

    /// Template variable, repeatable.
    #[arg(
        short = 't',
        long = "template-var",
        value_name = "NAME:VALUE",
        value_parser = parse_template_var
    )]
    template_vars: Vec<(String, String)>,

    /// Image device inside the fakemachine. Set by the host process.
    #[arg(long, value_name = "DEVICE", hide = true)]
    internal_image: Option<PathBuf>,

    /// Run everything on the host, even when fakemachine is available.
    #[arg(long)]
    disable_fakemachine: bool,
}

/// Split `NAME:VALUE` (or `NAME=VALUE`) at the first separator. A value in
/// double quotes is unquoted.
fn parse_template_var(raw: &str) -> Result<(String, String), String> {
    let Some(split) = raw.find([':', '=']) else {
        return Err(format!("expected NAME:VALUE, got '{}'", raw));
    };
    let (name, value) = (raw[..split].trim(), &raw[split + 1..]);
    if name.is_empty() {
        return Err(format!("missing variable name in '{}'", raw));
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Ok((name.to_string(), value.to_string()))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let options = SessionOptions {
        recipe: cli.recipe,
        artifactdir: cli.artifactdir,
        internal_image: cli.internal_image,
        template_vars: cli.template_vars.into_iter().collect(),
    };

    let backend: Box<dyn MachineBackend> = if cli.disable_fakemachine {
        Box::new(HostOnly)
    } else {
        Box::new(Fakemachine::new())
    };

    let code = match session::run(&options, backend.as_ref()) {
        Ok(Outcome::Completed) => 0,
        Ok(Outcome::SandboxExited(code)) => {
            error!(code, "Build failed inside fakemachine");
            code
        }
        Err(err) => {
            error!("{:#}", err);
            1
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_template_var() {
        assert_eq!(
            parse_template_var("release=bullseye").unwrap(),
            ("release".into(), "bullseye".into())
        );
        assert_eq!(
            parse_template_var("t:release=bullseye").unwrap(),
            ("t".into(), "release=bullseye".into())
        );
        assert_eq!(
            parse_template_var("mirror:\"http://deb.example/debian\"").unwrap(),
            ("mirror".into(), "http://deb.example/debian".into())
        );
        assert_eq!(parse_template_var("empty:").unwrap(), ("empty".into(), "".into()));
        assert!(parse_template_var("novalue").is_err());
        assert!(parse_template_var(":value").is_err());
    }

    #[test]
    fn test_forwarded_arguments_parse() {
        let cli = Cli::try_parse_from([
            "recipe-builder",
            "--artifactdir",
            "/out",
            "--template-var",
            "suite:\"bookworm\"",
            "/recipes/base.toml",
            "--internal-image",
            "/dev/vda",
        ])
        .unwrap();

        assert_eq!(cli.recipe, PathBuf::from("/recipes/base.toml"));
        assert_eq!(cli.artifactdir, Some(PathBuf::from("/out")));
        assert_eq!(cli.template_vars, vec![("suite".to_string(), "bookworm".to_string())]);
        assert_eq!(cli.internal_image, Some(PathBuf::from("/dev/vda")));
        assert!(!cli.disable_fakemachine);
    }

    #[test]
    fn test_recipe_is_required() {
        assert!(Cli::try_parse_from(["recipe-builder", "--disable-fakemachine"]).is_err());
    }
}
