//! Objets tas de Lumen et la liste qui les possède.
//!
//! Il n'y a pas de ramasse-miettes : chaque objet est un `Rc` partagé par
//! toutes les valeurs qui le référencent, et le [`Heap`] qui l'a vu naître
//! en garde une copie jusqu'au teardown de la VM. Quand le `Heap` est
//! abandonné, tous les `Rc` qu'il détenait perdent une référence ; les
//! objets encore vivants ailleurs (par ex. capturés dans une `Value` que
//! l'appelant a conservée) survivent le temps normal d'un `Rc`.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::value::Value;

/// Référence vers un objet tas. Bon marché à cloner (clone de `Rc`).
#[derive(Clone)]
pub enum Obj {
    /// Chaîne immuable internée.
    String(Rc<LString>),
    /// Fonction compilée (un par fonction source + une pour le script).
    Function(Rc<LFunction>),
    /// Fermeture : une fonction plus ses upvalues résolues.
    Closure(Rc<Closure>),
    /// Cellule d'upvalue, ouverte ou fermée.
    Upvalue(Rc<RefCell<Upvalue>>),
    /// Fonction native exposée par l'hôte.
    Native(Rc<Native>),
}

impl Obj {
    /// Égalité par identité de référence, utilisée par `Value::eq`.
    pub fn ptr_eq(&self, other: &Obj) -> bool {
        match (self, other) {
            (Obj::String(a), Obj::String(b)) => Rc::ptr_eq(a, b),
            (Obj::Function(a), Obj::Function(b)) => Rc::ptr_eq(a, b),
            (Obj::Closure(a), Obj::Closure(b)) => Rc::ptr_eq(a, b),
            (Obj::Upvalue(a), Obj::Upvalue(b)) => Rc::ptr_eq(a, b),
            (Obj::Native(a), Obj::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Nom de type pour les messages d'erreur et le disassembleur.
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Native(_) => "native",
        }
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obj::String(s) => write!(f, "{}", s.as_str_lossy()),
            Obj::Function(fun) => match &fun.name {
                Some(name) => write!(f, "<fn {}>", name.as_str_lossy()),
                None => write!(f, "<script>"),
            },
            Obj::Closure(c) => write!(f, "{}", Obj::Function(c.function.clone())),
            Obj::Upvalue(_) => write!(f, "upvalue"),
            Obj::Native(_) => write!(f, "<native fn>"),
        }
    }
}

/// Chaîne immuable, internée : il n'existe au plus qu'une `LString` par
/// contenu d'octets dans une VM donnée.
pub struct LString {
    bytes: Box<[u8]>,
    /// FNV-1a précalculé, utilisé par la table de hachage et l'interner.
    pub hash: u32,
}

impl LString {
    /// Construit une chaîne à partir d'octets bruts, sans intern.
    ///
    /// L'intern proprement dit (dédup via [`crate::table::Table::find_string`])
    /// est la responsabilité de l'appelant ; ce constructeur se contente de
    /// calculer le hash.
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        let bytes = bytes.into();
        let hash = crate::fnv1a_32(&bytes);
        Self { bytes, hash }
    }

    /// Les octets bruts de la chaîne.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Longueur en octets.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// `true` si la chaîne est vide.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Rendu lisible (perd les octets non UTF-8, qui ne sont produits par
    /// aucun programme source valide).
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

impl fmt::Debug for LString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LString({:?})", self.as_str_lossy())
    }
}

/// Fonction compilée : arité, upvalues attendues, nom optionnel et chunk.
pub struct LFunction {
    /// Nombre de paramètres déclarés (0..=255).
    pub arity: u8,
    /// Nombre d'upvalues que les fermetures de cette fonction doivent capturer.
    pub upvalue_count: usize,
    /// Nom de la fonction, ou `None` pour le script top-level (`<script>`).
    pub name: Option<Rc<LString>>,
    /// Bytecode de cette fonction.
    pub chunk: Chunk,
}

impl LFunction {
    /// Construit une fonction vide prête à recevoir du bytecode.
    pub fn new(name: Option<Rc<LString>>) -> Self {
        Self { arity: 0, upvalue_count: 0, name, chunk: Chunk::new() }
    }
}

impl fmt::Debug for LFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(n) => write!(f, "<fn {} /{}>", n.as_str_lossy(), self.arity),
            None => write!(f, "<script>"),
        }
    }
}

/// Fermeture : une fonction plus un vecteur de taille fixe d'upvalues
/// résolues, de longueur égale à `function.upvalue_count`.
pub struct Closure {
    /// Fonction sous-jacente.
    pub function: Rc<LFunction>,
    /// Cellules d'upvalues capturées, dans l'ordre déclaré par le compilateur.
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Closure {
    /// Construit une fermeture sans upvalue (remplies ensuite par `MAKE_CLOSURE`).
    pub fn new(function: Rc<LFunction>) -> Self {
        let upvalue_count = function.upvalue_count;
        Self { function, upvalues: Vec::with_capacity(upvalue_count) }
    }
}

/// Emplacement référencé par une upvalue : toujours une case de la pile de
/// valeurs tant qu'elle est ouverte, une cellule propre une fois fermée.
pub enum Upvalue {
    /// Upvalue ouverte : référence l'index `slot` dans la pile de la VM.
    Open(usize),
    /// Upvalue fermée : la valeur a été copiée hors de la pile.
    Closed(Value),
}

impl Upvalue {
    /// L'index de pile référencé si cette upvalue est encore ouverte.
    pub fn open_slot(&self) -> Option<usize> {
        match self {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        }
    }
}

/// Signature des fonctions natives : compte d'arguments implicite via la
/// longueur de la tranche, pas de suspension possible.
pub type NativeFn = fn(&[Value]) -> Value;

/// Fonction native exposée par l'hôte (ex. `clock`).
pub struct Native {
    /// Nom sous lequel la fonction est visible dans les globales.
    pub name: Rc<LString>,
    /// Pointeur de fonction appelé par `CALL`.
    pub function: NativeFn,
}

/// Liste de tous les objets tas alloués par une VM, responsable du teardown
/// en bloc. Tient lieu d'équivalent sûr à la liste chaînée intrusive du
/// modèle de référence : chaque objet créé y est suivi en plus d'être
/// référencé normalement par les valeurs qui le pointent.
#[derive(Default)]
pub struct Heap {
    objects: Vec<Obj>,
}

impl Heap {
    /// Tas vide.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enregistre un objet fraîchement alloué. Ne duplique pas son contenu :
    /// `obj` est un clone de `Rc`, donc bon marché.
    pub fn track(&mut self, obj: Obj) {
        self.objects.push(obj);
    }

    /// Nombre d'objets actuellement suivis par ce tas.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// `true` si aucun objet n'a encore été alloué.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interned_strings_compare_by_identity() {
        let a = Rc::new(LString::new(*b"foo"));
        let b = a.clone();
        let c = Rc::new(LString::new(*b"foo"));
        assert!(Obj::String(a).ptr_eq(&Obj::String(b)));
        assert!(!Obj::String(c.clone()).ptr_eq(&Obj::String(Rc::new(LString::new(*b"foo")))));
        let _ = c;
    }

    #[test]
    fn function_displays_as_script_without_name() {
        let f = Rc::new(LFunction::new(None));
        assert_eq!(format!("{}", Obj::Function(f)), "<script>");
    }

    #[test]
    fn heap_tracks_every_allocation() {
        let mut heap = Heap::new();
        heap.track(Obj::String(Rc::new(LString::new(*b"a"))));
        heap.track(Obj::String(Rc::new(LString::new(*b"b"))));
        assert_eq!(heap.len(), 2);
    }
}
