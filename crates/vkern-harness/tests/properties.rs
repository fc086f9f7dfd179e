#![forbid(unsafe_code)]

//! Property tests: scope stack balance and lens set/get agreement.

use proptest::prelude::*;
use vkern_core::SessionContext;
use vkern_core::binding::{self, clear_thread_stack};
use vkern_runtime::{Store, Value};

/// One step of a nesting script: `Some(i)` enters session `i`, `None` the
/// process-wide scope.
fn script() -> impl Strategy<Value = Vec<Option<usize>>> {
    prop::collection::vec(prop::option::of(0usize..4), 0..32)
}

proptest! {
    #[test]
    fn balanced_enter_exit_restores_every_level(steps in script()) {
        clear_thread_stack();
        let sessions: Vec<SessionContext> =
            (0..4).map(|i| SessionContext::new(format!("prop-{i}"))).collect();

        let mut tokens = Vec::new();
        let mut expected = vec![None];
        for step in &steps {
            let token = match step {
                Some(i) => binding::enter(&sessions[*i]).unwrap(),
                None => binding::enter_global().unwrap(),
            };
            expected.push(step.map(|i| sessions[i].id().clone()));
            prop_assert_eq!(binding::current_id(), expected.last().cloned().flatten());
            tokens.push(token);
        }
        prop_assert_eq!(binding::depth(), steps.len());

        while let Some(token) = tokens.pop() {
            binding::exit(token).unwrap();
            expected.pop();
            prop_assert_eq!(binding::current_id(), expected.last().cloned().flatten());
        }
        prop_assert_eq!(binding::depth(), 0);
        prop_assert!(binding::current().is_none());
    }

    #[test]
    fn key_lens_set_then_get(
        initial in prop::collection::btree_map("[a-e]", any::<i64>(), 0..5),
        key in "[a-e]",
        value in any::<i64>(),
    ) {
        let store = Store::new(Value::from(initial.clone()));
        store.key(key.clone()).set(value).unwrap();

        prop_assert_eq!(store.key(key.clone()).get(), Ok(Value::from(value)));
        for (other, v) in &initial {
            if *other != key {
                prop_assert_eq!(store.key(other.clone()).get(), Ok(Value::from(*v)));
            }
        }
    }
}
