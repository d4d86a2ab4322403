//! Table de hachage à adressage ouvert, sondage linéaire.
//!
//! Utilisée pour deux rôles distincts par la VM : l'ensemble des chaînes
//! internées (`strings`, valeurs ignorées) et la table des globales
//! (`globals`, nom → valeur courante). Les clés sont toujours des chaînes
//! internées, donc la comparaison de clé est une comparaison d'identité de
//! référence (`Rc::ptr_eq`), jamais une comparaison d'octets.

use std::rc::Rc;

use crate::object::LString;
use crate::value::Value;

/// Une entrée de table. Trois états possibles :
/// - vide : `key = None`, `value = Nil` ;
/// - tombstone : `key = None`, `value = Bool(true)` ;
/// - vivante : `key = Some(_)`.
#[derive(Clone)]
struct Entry {
    key: Option<Rc<LString>>,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self { key: None, value: Value::Nil }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }

    fn is_empty_slot(&self) -> bool {
        self.key.is_none() && !self.is_tombstone()
    }
}

const MAX_LOAD_FACTOR: f64 = 0.75;
const INITIAL_CAPACITY: usize = 8;

/// Table de hachage { clé interned → valeur }, ou ensemble de clés quand la
/// valeur est ignorée (c'est l'usage qu'en fait l'interner).
#[derive(Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Vivantes + tombstones : ce qui compte pour le facteur de charge.
    count: usize,
}

impl Table {
    /// Table vide ; aucune allocation tant qu'aucune entrée n'est insérée.
    pub fn new() -> Self {
        Self { entries: Vec::new(), count: 0 }
    }

    /// Nombre d'entrées vivantes ou tombstone. Invariant : `count <= capacity`.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Capacité actuelle du tableau d'entrées.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Lit la valeur associée à `key`, si présente.
    pub fn get(&self, key: &Rc<LString>) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.find_entry_index(key);
        let entry = &self.entries[index];
        entry.key.as_ref()?;
        Some(entry.value.clone())
    }

    /// Insère ou remplace `key -> value`. Renvoie `true` si la clé était
    /// absente auparavant (qu'elle n'ait jamais existé ou qu'elle ait été
    /// supprimée).
    pub fn set(&mut self, key: Rc<LString>, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR {
            let new_capacity = if self.capacity() == 0 { INITIAL_CAPACITY } else { self.capacity() * 2 };
            self.grow(new_capacity);
        }
        let index = self.find_entry_index(&key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_none();
        if is_new_key && entry.is_empty_slot() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new_key
    }

    /// Supprime `key`, en laissant un tombstone derrière pour préserver les
    /// chaînes de sondage des autres clés. Renvoie `true` si `key` était
    /// présente.
    pub fn delete(&mut self, key: &Rc<LString>) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = self.find_entry_index(key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::Bool(true);
        true
    }

    /// Copie toutes les entrées vivantes de `self` vers `to`.
    pub fn add_all(&self, to: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = &entry.key {
                to.set(key.clone(), entry.value.clone());
            }
        }
    }

    /// Primitive d'interning : retrouve une chaîne déjà internée de contenu
    /// `bytes` sans avoir besoin d'un `Rc<LString>` existant pour comparer.
    pub fn find_string(&self, bytes: &[u8], hash: u32) -> Option<Rc<LString>> {
        if self.entries.is_empty() {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            match &entry.key {
                None if entry.is_empty_slot() => return None,
                None => {} // tombstone: continue probing
                Some(k) => {
                    if k.hash == hash && k.as_bytes() == bytes {
                        return Some(k.clone());
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    fn find_entry_index(&self, key: &Rc<LString>) -> usize {
        find_entry_index_in(&self.entries, key)
    }

    fn grow(&mut self, new_capacity: usize) {
        #[cfg(feature = "tracing")]
        tracing::trace!(old_capacity = self.entries.len(), new_capacity, "table growing");
        let mut new_entries: Vec<Entry> = (0..new_capacity).map(|_| Entry::empty()).collect();
        let mut new_count = 0;
        for entry in self.entries.drain(..) {
            if let Some(key) = entry.key {
                let index = find_entry_index_in(&new_entries, &key);
                new_entries[index] = Entry { key: Some(key), value: entry.value };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }
}

/// Sondage linéaire à partir de `key.hash mod capacity`, en s'arrêtant sur
/// le premier slot vide rencontré et en mémorisant le premier tombstone
/// pour le réutiliser si la clé n'est pas trouvée.
fn find_entry_index_in(entries: &[Entry], key: &Rc<LString>) -> usize {
    let capacity = entries.len();
    let mut index = key.hash as usize % capacity;
    let mut tombstone: Option<usize> = None;
    loop {
        let entry = &entries[index];
        match &entry.key {
            None if entry.is_empty_slot() => return tombstone.unwrap_or(index),
            None => {
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            }
            Some(k) => {
                if Rc::ptr_eq(k, key) {
                    return index;
                }
            }
        }
        index = (index + 1) % capacity;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(bytes: &[u8]) -> Rc<LString> {
        Rc::new(LString::new(bytes.to_vec().into_boxed_slice()))
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut t = Table::new();
        let k = s(b"x");
        assert!(t.set(k.clone(), Value::Number(1.0)));
        assert_eq!(t.get(&k), Some(Value::Number(1.0)));
    }

    #[test]
    fn set_on_existing_key_returns_false_and_overwrites() {
        let mut t = Table::new();
        let k = s(b"x");
        t.set(k.clone(), Value::Number(1.0));
        assert!(!t.set(k.clone(), Value::Number(2.0)));
        assert_eq!(t.get(&k), Some(Value::Number(2.0)));
    }

    #[test]
    fn delete_then_get_misses() {
        let mut t = Table::new();
        let k = s(b"x");
        t.set(k.clone(), Value::Number(1.0));
        assert!(t.delete(&k));
        assert_eq!(t.get(&k), None);
        assert!(!t.delete(&k));
    }

    #[test]
    fn grows_before_load_factor_exceeds_three_quarters() {
        let mut t = Table::new();
        for i in 0..100u32 {
            let k = s(i.to_le_bytes().as_slice());
            t.set(k, Value::Number(i as f64));
            assert!(t.count() as f64 <= t.capacity() as f64 * MAX_LOAD_FACTOR + 1.0);
        }
    }

    #[test]
    fn find_string_locates_existing_interned_bytes() {
        let mut t = Table::new();
        let k = s(b"hello");
        t.set(k.clone(), Value::Nil);
        let found = t.find_string(b"hello", k.hash).expect("should find");
        assert!(Rc::ptr_eq(&found, &k));
        assert!(t.find_string(b"nope", crate::fnv1a_32(b"nope")).is_none());
    }

    #[test]
    fn growth_drops_tombstones() {
        let mut t = Table::new();
        for i in 0..6u32 {
            let k = s(i.to_le_bytes().as_slice());
            t.set(k.clone(), Value::Number(i as f64));
        }
        let to_delete = s(0u32.to_le_bytes().as_slice());
        // not the same Rc identity as inserted key, so re-find via find_string first
        let existing = t.find_string(to_delete.as_bytes(), to_delete.hash).unwrap();
        t.delete(&existing);
        let count_before = t.count();
        // force growth
        for i in 6..12u32 {
            let k = s(i.to_le_bytes().as_slice());
            t.set(k, Value::Number(i as f64));
        }
        assert!(t.count() <= count_before + 6);
    }
}
