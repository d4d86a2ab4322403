//! lumen-cli/src/main.rs — point d'entrée du binaire `lumen`.
//!
//! Prépare l'environnement (rapports d'erreurs, logs) puis délègue toute la
//! logique à [`lumen_cli::run`], qui renvoie directement le code de sortie
//! attendu par le contrat du CLI.

use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(err) = color_eyre::install() {
        eprintln!("lumen: couldn't install color-eyre: {err}");
    }
    env_logger::init();

    lumen_cli::run()
}
