use std::any::Any;

/// Type-erased per-connection user context.
///
/// Protocol layers park their decoder state here and get it back by
/// type. Asking for the wrong type is a programming error and panics at
/// the point of misuse.
#[derive(Default)]
pub struct Context {
    value: Option<Box<dyn Any + Send>>,
}

impl Context {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self { value: Some(Box::new(value)) }
    }

    pub fn set<T: Any + Send>(&mut self, value: T) {
        self.value = Some(Box::new(value));
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    /// # Panics
    /// Panics when nothing is stored or the stored type is not `T`.
    pub fn get<T: Any + Send>(&self) -> &T {
        self.value
            .as_deref()
            .expect("context is empty")
            .downcast_ref::<T>()
            .expect("context type mismatch")
    }

    /// # Panics
    /// Panics when nothing is stored or the stored type is not `T`.
    pub fn get_mut<T: Any + Send>(&mut self) -> &mut T {
        self.value
            .as_deref_mut()
            .expect("context is empty")
            .downcast_mut::<T>()
            .expect("context type mismatch")
    }

    /// Removes and returns the stored value when it is a `T`; leaves it
    /// in place otherwise.
    pub fn take<T: Any + Send>(&mut self) -> Option<T> {
        let boxed = self.value.take()?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.value = Some(other);
                None
            }
        }
    }

    pub fn clear(&mut self) {
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_returns_by_type() {
        let mut ctx = Context::default();
        assert!(!ctx.is_set());
        ctx.set(41u32);
        *ctx.get_mut::<u32>() += 1;
        assert_eq!(*ctx.get::<u32>(), 42);
    }

    #[test]
    fn replaces_previous_value() {
        let mut ctx = Context::new(String::from("old"));
        ctx.set(7i64);
        assert_eq!(*ctx.get::<i64>(), 7);
    }

    #[test]
    fn take_moves_the_value_out() {
        let mut ctx = Context::new(vec![1u8, 2, 3]);
        assert_eq!(ctx.take::<Vec<u8>>(), Some(vec![1, 2, 3]));
        assert!(!ctx.is_set());
    }

    #[test]
    fn take_of_wrong_type_keeps_the_value() {
        let mut ctx = Context::new(5u16);
        assert_eq!(ctx.take::<String>(), None);
        assert_eq!(*ctx.get::<u16>(), 5);
    }

    #[test]
    #[should_panic(expected = "context type mismatch")]
    fn wrong_type_panics() {
        let ctx = Context::new(1u8);
        let _ = ctx.get::<u64>();
    }
}
