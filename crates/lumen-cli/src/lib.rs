//! lumen-cli — pilote en ligne de commande pour Lumen.
//!
//! `main.rs` reste minimal (installation de `color-eyre`, init des logs) et
//! délègue tout à [`run`], ce qui laisse cette logique testable en unité
//! sans passer par un vrai process (cf. `vitte-cli`, dont ce crate reprend
//! la répartition lib/bin).
//!
//! Contrat (spec.md §6) : `lumen [path]`. Sans argument, REPL lisant une
//! ligne à la fois. Un argument, exécute le fichier. Plus d'un argument,
//! message d'usage et code 64. Erreur de compilation : 65. Erreur
//! d'exécution : 70. Échec de lecture du script : 74. Ce sont les codes de
//! `<sysexits.h>` qu'utilise déjà le `main.c` de référence.

#![deny(rust_2018_idioms, unused_must_use)]
#![warn(missing_docs)]

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use lumen_vm::{InterpretResult, Vm};

/// Issue d'une invocation du CLI, indépendante de [`std::process::ExitCode`]
/// (qui n'implémente ni `PartialEq` ni `Debug`) pour rester testable en unité.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliExit {
    /// Tout s'est bien passé.
    Ok,
    /// Usage incorrect de la ligne de commande (sysexits `EX_USAGE`, 64).
    Usage,
    /// Erreur de compilation Lumen (sysexits `EX_DATAERR`, 65).
    DataErr,
    /// Erreur d'exécution Lumen (sysexits `EX_SOFTWARE`, 70).
    Software,
    /// Échec de lecture du fichier script (sysexits `EX_IOERR`, 74).
    IoErr,
}

impl CliExit {
    fn code(self) -> u8 {
        match self {
            CliExit::Ok => 0,
            CliExit::Usage => 64,
            CliExit::DataErr => 65,
            CliExit::Software => 70,
            CliExit::IoErr => 74,
        }
    }
}

impl From<CliExit> for ExitCode {
    fn from(exit: CliExit) -> Self {
        ExitCode::from(exit.code())
    }
}

/// Arguments de la ligne de commande.
///
/// Le contrat n'accepte qu'un seul chemin de script au plus ; `paths` capture
/// tous les positionnels fournis pour qu'on puisse distinguer "aucun" (REPL),
/// "un" (exécution de fichier) et "plusieurs" (usage incorrect, code 64) sans
/// dépendre du message d'erreur générique de `clap`.
#[derive(Parser, Debug)]
#[command(name = "lumen", version, about = "Interpreter for the Lumen scripting language")]
struct Cli {
    /// Script(s) Lumen ; exactement zéro ou un chemin est accepté.
    paths: Vec<PathBuf>,

    /// Active la trace d'instructions de la VM (nécessite la feature `tracing`).
    #[arg(long)]
    trace: bool,
}

/// Point d'entrée appelé par `main`.
pub fn run() -> ExitCode {
    let cli = Cli::parse();

    #[cfg(feature = "tracing")]
    if cli.trace {
        tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    }
    #[cfg(not(feature = "tracing"))]
    if cli.trace {
        eprintln!("lumen: --trace has no effect; rebuild with the `tracing` feature enabled");
    }

    let mut vm = Vm::new();
    vm.register_native("clock", lumen_vm::clock_native);

    let exit = match cli.paths.as_slice() {
        [] => run_repl(&mut vm),
        [path] => run_file(&mut vm, path),
        _ => {
            eprintln!("Usage: lumen [path]");
            CliExit::Usage
        }
    };
    exit.into()
}

/// Lit `path` en entier puis l'interprète une fois.
///
/// Le contexte `anyhow` sert uniquement à enrichir le message affiché à
/// l'utilisateur ; le code de sortie reste celui que §6 attribue à une
/// erreur d'E/S, pas un code générique.
fn run_file(vm: &mut Vm, path: &Path) -> CliExit {
    let source = match fs::read_to_string(path).with_context(|| format!("can't open file \"{}\"", path.display()))
    {
        Ok(source) => source,
        Err(err) => {
            eprintln!("{err:#}");
            return CliExit::IoErr;
        }
    };
    exit_for(vm.interpret(&source))
}

/// Boucle REPL : un `>` par ligne, EOF propre en sortie de code 0.
///
/// Comme la REPL du modèle de référence, le résultat de chaque ligne
/// n'affecte jamais le code de sortie : seule l'exécution d'un script
/// entier via `run_file` le fait.
fn run_repl(vm: &mut Vm) -> CliExit {
    let stdin = io::stdin();
    let mut locked = stdin.lock();
    let mut line = String::new();
    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            return CliExit::IoErr;
        }
        line.clear();
        match locked.read_line(&mut line) {
            Ok(0) => {
                println!();
                return CliExit::Ok;
            }
            Ok(_) => {
                vm.interpret(&line);
            }
            Err(_) => return CliExit::IoErr,
        }
    }
}

fn exit_for(result: InterpretResult) -> CliExit {
    match result {
        InterpretResult::Ok => CliExit::Ok,
        InterpretResult::CompileError => CliExit::DataErr,
        InterpretResult::RuntimeError => CliExit::Software,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn exit_code_mapping_matches_sysexits() {
        assert_eq!(exit_for(InterpretResult::Ok), CliExit::Ok);
        assert_eq!(exit_for(InterpretResult::CompileError), CliExit::DataErr);
        assert_eq!(exit_for(InterpretResult::RuntimeError), CliExit::Software);
        assert_eq!(CliExit::Ok.code(), 0);
        assert_eq!(CliExit::Usage.code(), 64);
        assert_eq!(CliExit::DataErr.code(), 65);
        assert_eq!(CliExit::Software.code(), 70);
        assert_eq!(CliExit::IoErr.code(), 74);
    }

    #[test]
    fn run_file_executes_a_script_on_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "print 1 + 2;").expect("write script");
        let mut vm = Vm::new();
        assert_eq!(run_file(&mut vm, file.path()), CliExit::Ok);
    }

    #[test]
    fn run_file_reports_io_error_for_a_missing_path() {
        let mut vm = Vm::new();
        let exit = run_file(&mut vm, Path::new("/nonexistent/does-not-exist.lum"));
        assert_eq!(exit, CliExit::IoErr);
    }

    #[test]
    fn run_file_reports_compile_error_exit_code() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "var =;").expect("write script");
        let mut vm = Vm::new();
        assert_eq!(run_file(&mut vm, file.path()), CliExit::DataErr);
    }

    #[test]
    fn run_file_reports_runtime_error_exit_code() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "print undefined_name;").expect("write script");
        let mut vm = Vm::new();
        assert_eq!(run_file(&mut vm, file.path()), CliExit::Software);
    }

    #[test]
    fn clock_native_is_registered_for_every_run() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "print clock() >= 0;").expect("write script");
        let mut vm = Vm::new();
        vm.register_native("clock", lumen_vm::clock_native);
        assert_eq!(run_file(&mut vm, file.path()), CliExit::Ok);
    }
}
