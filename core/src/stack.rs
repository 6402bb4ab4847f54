//! Persistent path stack
//!
//! `ImmutableStack` records the partition indices leading to a node while the
//! writable tree is being prepared. Frames are shared cons cells behind `Arc`,
//! so `push` and `pop` return new stacks and never alter the receiver. A clone
//! is a pointer copy, which lets parallel subtree builders each own a stack
//! that shares the common ancestor frames.

use std::fmt;
use std::sync::Arc;

use crate::error::{CoreError, Result};

struct Frame<T> {
    value: T,
    below: Option<Arc<Frame<T>>>,
}

/// A persistent stack with structural sharing
pub struct ImmutableStack<T> {
    top: Option<Arc<Frame<T>>>,
    len: usize,
}

impl<T> ImmutableStack<T> {
    /// Create an empty stack
    pub fn new() -> Self {
        Self { top: None, len: 0 }
    }

    /// Return a new stack with `value` on top
    pub fn push(&self, value: T) -> Self {
        Self {
            top: Some(Arc::new(Frame {
                value,
                below: self.top.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// Return the stack below the top frame
    pub fn pop(&self) -> Result<Self> {
        let frame = self.top.as_ref().ok_or(CoreError::EmptyStackError)?;
        Ok(Self {
            top: frame.below.clone(),
            len: self.len - 1,
        })
    }

    /// Return the top value
    pub fn peek(&self) -> Result<&T> {
        self.top
            .as_ref()
            .map(|frame| &frame.value)
            .ok_or(CoreError::EmptyStackError)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate from the top of the stack to the bottom
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.top.as_deref(),
        }
    }

    /// Values from the bottom of the stack to the top
    pub fn to_vec(&self) -> Vec<&T> {
        let mut values: Vec<&T> = self.iter().collect();
        values.reverse();
        values
    }
}

impl<T> Clone for ImmutableStack<T> {
    fn clone(&self) -> Self {
        Self {
            top: self.top.clone(),
            len: self.len,
        }
    }
}

impl<T> Default for ImmutableStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq> PartialEq for ImmutableStack<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl<T: Eq> Eq for ImmutableStack<T> {}

impl<T: fmt::Debug> fmt::Debug for ImmutableStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.to_vec()).finish()
    }
}

impl<T> Drop for ImmutableStack<T> {
    // Unlink uniquely owned frames iteratively so long stacks do not recurse on drop.
    fn drop(&mut self) {
        let mut next = self.top.take();
        while let Some(frame) = next {
            match Arc::try_unwrap(frame) {
                Ok(mut owned) => next = owned.below.take(),
                Err(_) => break,
            }
        }
    }
}

/// Iterator over stack values, top first
pub struct Iter<'a, T> {
    next: Option<&'a Frame<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.next.map(|frame| {
            self.next = frame.below.as_deref();
            &frame.value
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_pop_peek() {
        let empty: ImmutableStack<&str> = ImmutableStack::new();
        let one = empty.push("DE");
        let two = one.push("2020-05-01");

        assert_eq!(*two.peek().unwrap(), "2020-05-01");
        assert_eq!(two.len(), 2);
        assert_eq!(two.pop().unwrap(), one);
        assert_eq!(*one.peek().unwrap(), "DE");
        assert!(empty.is_empty());
    }

    #[test]
    fn test_empty_stack_errors() {
        let empty: ImmutableStack<u32> = ImmutableStack::new();
        assert!(matches!(empty.pop(), Err(CoreError::EmptyStackError)));
        assert!(matches!(empty.peek(), Err(CoreError::EmptyStackError)));
    }

    #[test]
    fn test_siblings_share_parent_without_interference() {
        let parent = ImmutableStack::new().push(1).push(2);
        let left = parent.push(10);
        let right = parent.push(20);

        assert_eq!(left.to_vec(), vec![&1, &2, &10]);
        assert_eq!(right.to_vec(), vec![&1, &2, &20]);
        assert_eq!(parent.to_vec(), vec![&1, &2]);
    }

    #[test]
    fn test_stack_is_shareable_across_threads() {
        let base = ImmutableStack::new().push("root".to_string());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let stack = base.clone();
                std::thread::spawn(move || stack.push(format!("branch-{}", i)).len())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 2);
        }
        assert_eq!(base.len(), 1);
    }

    #[test]
    fn test_deep_stack_drops() {
        let mut stack = ImmutableStack::new();
        for i in 0..200_000u32 {
            stack = stack.push(i);
        }
        assert_eq!(stack.len(), 200_000);
        drop(stack);
    }

    proptest! {
        #[test]
        fn prop_push_then_pop_is_identity(values in proptest::collection::vec(any::<i64>(), 0..32), extra in any::<i64>()) {
            let mut stack = ImmutableStack::new();
            for v in &values {
                stack = stack.push(*v);
            }
            let snapshot: Vec<i64> = stack.iter().copied().collect();

            let popped = stack.push(extra).pop().unwrap();
            prop_assert_eq!(&popped, &stack);

            let after: Vec<i64> = stack.iter().copied().collect();
            prop_assert_eq!(snapshot, after);
        }
    }
}
