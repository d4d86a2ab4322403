//! Fonctions natives fournies par l'hôte.
//!
//! La VM n'en installe aucune elle-même : spec.md §1 traite la configuration
//! du builtin `clock` comme la responsabilité d'un collaborateur externe
//! (le pilote — ici `lumen-cli`). Ce module ne fait qu'exposer la fonction ;
//! l'appelant décide de l'enregistrer via [`crate::Vm::register_native`].

use std::time::{SystemTime, UNIX_EPOCH};

use lumen_core::Value;

/// `clock()` — secondes écoulées depuis l'époque Unix, en double précision.
///
/// Équivalent du `ClockNative` du modèle de référence (`(double)clock() /
/// CLOCKS_PER_SEC`), mais basé sur une horloge murale puisque Rust n'expose
/// pas directement l'horloge processus de la libc.
pub fn clock_native(_args: &[Value]) -> Value {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    Value::Number(elapsed.as_secs_f64())
}
