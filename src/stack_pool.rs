use std::cell::RefCell;
use std::io;
use crate::stack::Stack;

/// Idle fiber stacks, handed out before new ones are mapped.
pub struct StackPool {
    stacks: RefCell<Vec<Stack>>,
    config: StackPoolConfig,
}

#[derive(Clone, Debug)]
pub struct StackPoolConfig {
    pub default_stack_size: usize,
    /// Upper bound on idle stacks kept around. 0 means unbounded.
    pub max_pool_size: usize,
}

impl Default for StackPoolConfig {
    fn default() -> Self {
        StackPoolConfig {
            default_stack_size: 256 * 1024,
            max_pool_size: 4096,
        }
    }
}

impl StackPool {
    pub fn new(config: StackPoolConfig) -> StackPool {
        StackPool {
            stacks: RefCell::new(Vec::new()),
            config,
        }
    }

    pub fn get(&self) -> io::Result<Stack> {
        match self.stacks.borrow_mut().pop() {
            Some(v) => {
                trace!("stack pool hit");
                Ok(v)
            }
            None => {
                trace!(size = self.config.default_stack_size, "stack pool miss");
                Stack::new(self.config.default_stack_size)
            }
        }
    }

    /// Returns a stack for reuse. A full pool unmaps it instead.
    pub fn put(&self, s: Stack) {
        let mut stacks = self.stacks.borrow_mut();
        let full = self.config.max_pool_size != 0 && stacks.len() >= self.config.max_pool_size;
        if full {
            trace!(size = s.size(), "stack pool full; releasing stack");
        } else {
            stacks.push(s);
        }
    }

    /// Number of idle stacks.
    pub fn len(&self) -> usize {
        self.stacks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_stack_should_be_reused() {
        let pool = StackPool::new(StackPoolConfig::default());
        let s = pool.get().unwrap();
        let rsp = s.initial_rsp();
        pool.put(s);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get().unwrap().initial_rsp(), rsp);
        assert!(pool.is_empty());
    }

    #[test]
    fn pool_should_respect_max_size() {
        let pool = StackPool::new(StackPoolConfig {
            default_stack_size: 8192,
            max_pool_size: 1,
        });
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let kept = a.initial_rsp();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get().unwrap().initial_rsp(), kept);
    }

    #[test]
    fn unbounded_pool_should_keep_every_stack() {
        let pool = StackPool::new(StackPoolConfig {
            default_stack_size: 8192,
            max_pool_size: 0,
        });
        let stacks: Vec<Stack> = (0..3).map(|_| pool.get().unwrap()).collect();
        for s in stacks {
            pool.put(s);
        }
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn oversized_config_should_fail_get() {
        let pool = StackPool::new(StackPoolConfig {
            default_stack_size: usize::MAX,
            max_pool_size: 1,
        });
        assert_eq!(pool.get().err().map(|e| e.kind()), Some(io::ErrorKind::InvalidInput));
    }
}
