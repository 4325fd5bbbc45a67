use crate::heap::Address;

/// Object-model capability the embedder supplies: how big an object is and
/// where its outgoing references live. The marking engine never inspects
/// object memory itself; every traversal goes through this seam, which is
/// what lets the concurrent-mark and update-references variants share one
/// state machine.
pub trait ObjectGraph: Sync {
    /// Size of the object starting at `obj`, in words.
    fn size_in_words(&self, obj: Address) -> usize;

    /// Invokes `f` for every outgoing reference of `obj`.
    fn visit_references(&self, obj: Address, f: &mut dyn FnMut(Address));

    /// True for reference arrays large enough to be worth slicing into
    /// chunked tasks. Models without arrays keep the default.
    fn is_reference_array(&self, _obj: Address) -> bool {
        false
    }

    /// Element count of a reference array. Only called when
    /// `is_reference_array` returned true.
    fn reference_array_len(&self, _obj: Address) -> usize {
        0
    }

    /// Invokes `f` for the references at indices `[from, to)` of a
    /// reference array.
    fn visit_array_slice(&self, obj: Address, from: usize, to: usize, f: &mut dyn FnMut(Address)) {
        let _ = (obj, from, to, f);
        unimplemented!("object model declared no reference arrays");
    }
}
