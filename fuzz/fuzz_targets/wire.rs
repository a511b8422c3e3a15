#![no_main]

use assay::convert::to_runtime;
use assay::{Type, TypedValue};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(typ) = Type::decode(data) {
        // Decoding what we encoded must give the same type back.
        assert_eq!(Type::decode(&typ.encode()).ok(), Some(typ.clone()));
        let _ = to_runtime(&TypedValue::scalar(typ, data.to_vec()));
    }
    if let Ok(value) = serde_json::from_slice::<TypedValue>(data) {
        let _ = to_runtime(&value);
    }
});
