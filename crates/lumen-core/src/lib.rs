//! lumen-core — valeurs, objets tas, interning et format de bytecode
//!
//! Ce crate ne connaît ni le lexer, ni le compilateur, ni la VM : il fournit
//! les briques partagées par les trois.
//!
//! ## Modules
//! - [`value`]  : l'union étiquetée `Value` (nil, bool, nombre, objet tas).
//! - [`object`] : les objets tas (`String`, `Function`, `Closure`, `Upvalue`,
//!   `Native`) et le `Heap` qui les possède jusqu'au teardown de la VM.
//! - [`table`]  : table de hachage à adressage ouvert, utilisée à la fois
//!   pour l'interner de chaînes et pour les globales.
//! - [`chunk`]  : chunk de bytecode (octets + lignes + pool de constantes)
//!   et le jeu d'opcodes.
//!
//! Aucun de ces types n'effectue de collecte incrémentale : les objets tas
//! vivent jusqu'à ce que leur [`object::Heap`] soit abandonné.

#![deny(rust_2018_idioms, unused_must_use)]
#![warn(missing_docs)]

pub mod chunk;
pub mod object;
pub mod opcode;
pub mod table;
pub mod value;

pub use chunk::Chunk;
pub use object::{Closure, Heap, LFunction, LString, Native, NativeFn, Obj, Upvalue};
pub use opcode::OpCode;
pub use table::Table;
pub use value::Value;

use std::rc::Rc;

/// Interne une séquence d'octets : retrouve une [`LString`] existante de même
/// contenu dans `strings`, ou en alloue une nouvelle et l'enregistre à la
/// fois dans `heap` (teardown) et dans `strings` (déduplication future).
///
/// Partagée par le compilateur (identifiants, littéraux) et la VM
/// (concaténation) : c'est le seul point d'entrée qui crée des `LString`.
pub fn intern_string(heap: &mut Heap, strings: &mut Table, bytes: &[u8]) -> Rc<LString> {
    let hash = fnv1a_32(bytes);
    if let Some(existing) = strings.find_string(bytes, hash) {
        return existing;
    }
    #[cfg(feature = "tracing")]
    tracing::trace!(len = bytes.len(), "interning new string");
    let rc = Rc::new(LString::new(bytes.to_vec().into_boxed_slice()));
    heap.track(Obj::String(rc.clone()));
    strings.set(rc.clone(), Value::Nil);
    rc
}

/// FNV-1a 32-bit, utilisé pour le hash des chaînes internées.
///
/// Constantes canoniques de l'algorithme (offset basis et prime).
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
