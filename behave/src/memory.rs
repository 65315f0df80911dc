use std::collections::BTreeMap;

use twox_hash::XxHash64;

use crate::ValueType;

/// Stable 64-bit id of a component type, derived from its name.
#[must_use]
pub fn component_type_id(name: &str) -> u64 {
    XxHash64::oneshot(0, name.as_bytes())
}

#[inline]
pub(crate) fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub offset: u16,
    pub ty: ValueType,
}

/// Byte layout of one component type as the storage layer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentLayout {
    pub name: String,
    pub size: u16,
    pub fields: Vec<FieldLayout>,
}

impl ComponentLayout {
    /// Lays fields out in order with natural alignment.
    #[must_use]
    pub fn new(name: &str, fields: &[(&str, ValueType)]) -> Self {
        let mut offset = 0;
        let mut max_align = 1;
        let fields = fields
            .iter()
            .map(|(field, ty)| {
                offset = align_up(offset, ty.size());
                max_align = max_align.max(ty.size());
                let layout = FieldLayout {
                    name: (*field).to_owned(),
                    offset: offset as u16,
                    ty: *ty,
                };
                offset += ty.size();
                layout
            })
            .collect();

        Self {
            name: name.to_owned(),
            size: align_up(offset, max_align) as u16,
            fields,
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn type_id(&self) -> u64 {
        component_type_id(&self.name)
    }
}

/// The component types a program may read or write.
#[derive(Debug, Clone, Default)]
pub struct ComponentCatalog {
    types: BTreeMap<String, ComponentLayout>,
}

impl ComponentCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(
        &mut self,
        name: &str,
        fields: &[(&str, ValueType)],
    ) -> &ComponentLayout {
        let layout = ComponentLayout::new(name, fields);
        self.types.insert(name.to_owned(), layout);
        &self.types[name]
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ComponentLayout> {
        self.types.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentLayout> {
        self.types.values()
    }
}

/// Location of one blackboard variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarSlot {
    pub offset: u32,
    pub ty: ValueType,
}

impl VarSlot {
    #[inline]
    #[must_use]
    pub fn length(&self) -> usize {
        self.ty.size()
    }

    #[inline]
    #[must_use]
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.offset as usize;
        start..start + self.length()
    }
}

/// Name to slot table shared by a program and everything it invokes.
#[derive(Debug, Clone, Default)]
pub struct BlackboardLayout {
    vars: BTreeMap<String, VarSlot>,
    size: usize,
}

impl BlackboardLayout {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a variable, aligned to its size. Redeclaring a name with the
    /// same type returns the existing slot.
    pub fn declare(&mut self, name: &str, ty: ValueType) -> VarSlot {
        if let Some(slot) = self.vars.get(name) {
            if slot.ty == ty {
                return *slot;
            }
        }
        let offset = align_up(self.size, ty.size());
        let slot = VarSlot {
            offset: offset as u32,
            ty,
        };
        self.size = offset + ty.size();
        self.vars.insert(name.to_owned(), slot);
        slot
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<VarSlot> {
        self.vars.get(name).copied()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, VarSlot)> {
        self.vars.iter().map(|(name, slot)| (name.as_str(), *slot))
    }
}

/// Per-agent variable storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blackboard {
    bytes: Vec<u8>,
}

impl Blackboard {
    #[must_use]
    pub fn new(layout: &BlackboardLayout) -> Self {
        Self {
            bytes: vec![0; layout.size()],
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn get_bool(&self, slot: VarSlot) -> bool {
        self.bytes[slot.offset as usize] != 0
    }

    #[must_use]
    pub fn get_int(&self, slot: VarSlot) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[slot.range()]);
        i32::from_le_bytes(raw)
    }

    #[must_use]
    pub fn get_float(&self, slot: VarSlot) -> f32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[slot.range()]);
        f32::from_le_bytes(raw)
    }

    pub fn set_bool(&mut self, slot: VarSlot, value: bool) {
        self.bytes[slot.offset as usize] = u8::from(value);
    }

    pub fn set_int(&mut self, slot: VarSlot, value: i32) {
        self.bytes[slot.range()].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_float(&mut self, slot: VarSlot, value: f32) {
        self.bytes[slot.range()].copy_from_slice(&value.to_le_bytes());
    }
}

/// Writable component memory of the executing agent.
#[derive(Debug)]
pub struct ComponentHandle<'a> {
    pub type_id: u64,
    pub data: &'a mut [u8],
}

/// Read-only component memory of another entity.
#[derive(Debug, Clone, Copy)]
pub struct LookupHandle<'a> {
    pub type_id: u64,
    pub data: &'a [u8],
}
