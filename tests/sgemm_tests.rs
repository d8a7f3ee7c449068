//! sgemm accuracy and dispatch tests on the simulated device

mod common;

use common::{max_abs_diff, random_matrix, reference_sgemm, SimFixture};
use qpuforge::backend::simulated::SimEvent;
use qpuforge::{Layout, QpuForgeError, Transpose};

#[test]
fn test_sgemm_random_matches_reference() {
    let mut fixture = SimFixture::open();
    let (m, n, k) = (96, 3072, 363);
    let a_host = random_matrix(1, m * k);
    let b_host = random_matrix(2, k * n);
    let c_host = random_matrix(3, m * n);

    let a = fixture.upload(&a_host);
    let b = fixture.upload(&b_host);
    let mut c = fixture.upload(&c_host);

    fixture.device.clear_events();
    fixture
        .rt
        .sgemm(
            Layout::RowMajor,
            Transpose::NoTrans,
            Transpose::NoTrans,
            m,
            n,
            k,
            0.5,
            &a,
            k,
            &b,
            n,
            0.25,
            &mut c,
            n,
        )
        .unwrap();

    let mut expected = c_host.clone();
    reference_sgemm(false, m, n, k, 0.5, &a_host, k, &b_host, n, 0.25, &mut expected, n);
    let err = max_abs_diff(&c.as_f32()[..m * n], &expected);
    assert!(err < 1e-3, "max error {}", err);

    // 96 rows x 3072 cols: 2 row slabs by 6 column slabs
    assert!(fixture.events().contains(&SimEvent::Executed {
        units: 12,
        noflush: true,
        timeout_ms: 5_000
    }));

    fixture.keep(a);
    fixture.keep(b);
    fixture.keep(c);
    fixture.finish();
}

#[test]
fn test_sgemm_all_ones_accumulates() {
    let mut fixture = SimFixture::open();
    let (m, n, k) = (64, 256, 100);
    let a = fixture.upload(&vec![1.0; m * k]);
    let b = fixture.upload(&vec![1.0; k * n]);
    let mut c = fixture.upload(&vec![1.0; m * n]);

    fixture
        .rt
        .sgemm(
            Layout::RowMajor,
            Transpose::NoTrans,
            Transpose::NoTrans,
            m,
            n,
            k,
            1.0,
            &a,
            k,
            &b,
            n,
            1.0,
            &mut c,
            n,
        )
        .unwrap();

    assert!(c.as_f32()[..m * n].iter().all(|&x| x == (k + 1) as f32));

    fixture.keep(a);
    fixture.keep(b);
    fixture.keep(c);
    fixture.finish();
}

#[test]
fn test_sgemm_transposed_operands() {
    let mut fixture = SimFixture::open();
    let (m, n, k) = (192, 80, 50);
    // op(A) = A^T with A stored k x m, op(B) = B^T with B stored n x k
    let (lda, ldb, ldc) = (m + 8, k + 3, n + 16);
    let a_host = random_matrix(10, k * lda);
    let b_host = random_matrix(11, n * ldb);
    let c_host = random_matrix(12, m * ldc);

    let a = fixture.upload(&a_host);
    let b = fixture.upload(&b_host);
    let mut c = fixture.upload(&c_host);

    fixture
        .rt
        .sgemm(
            Layout::RowMajor,
            Transpose::Trans,
            Transpose::Trans,
            m,
            n,
            k,
            -1.5,
            &a,
            lda,
            &b,
            ldb,
            2.0,
            &mut c,
            ldc,
        )
        .unwrap();

    let mut expected = c_host.clone();
    reference_sgemm(true, m, n, k, -1.5, &a_host, lda, &b_host, ldb, 2.0, &mut expected, ldc);
    let err = max_abs_diff(&c.as_f32()[..m * ldc], &expected);
    assert!(err < 1e-3, "max error {}", err);

    // Padding columns of C are never written
    for i in 0..m {
        assert_eq!(&c.as_f32()[i * ldc + n..(i + 1) * ldc], &c_host[i * ldc + n..(i + 1) * ldc]);
    }

    fixture.keep(a);
    fixture.keep(b);
    fixture.keep(c);
    fixture.finish();
}

#[test]
fn test_sgemm_small_problem_runs_on_one_unit() {
    let mut fixture = SimFixture::open();
    let (m, n, k) = (15, 63, 7);
    let a_host = random_matrix(20, m * k);
    let b_host = random_matrix(21, k * n);
    let a = fixture.upload(&a_host);
    let b = fixture.upload(&b_host);
    let mut c = fixture.zeros(m * n);

    fixture.device.clear_events();
    fixture
        .rt
        .sgemm(
            Layout::RowMajor,
            Transpose::NoTrans,
            Transpose::NoTrans,
            m,
            n,
            k,
            1.0,
            &a,
            k,
            &b,
            n,
            0.0,
            &mut c,
            n,
        )
        .unwrap();

    let mut expected = vec![0.0; m * n];
    reference_sgemm(false, m, n, k, 1.0, &a_host, k, &b_host, n, 0.0, &mut expected, n);
    assert!(max_abs_diff(&c.as_f32()[..m * n], &expected) < 1e-4);

    let executed: Vec<_> = fixture
        .events()
        .into_iter()
        .filter(|e| matches!(e, SimEvent::Executed { .. }))
        .collect();
    assert_eq!(
        executed,
        vec![SimEvent::Executed {
            units: 1,
            noflush: true,
            timeout_ms: 100_000
        }]
    );

    fixture.keep(a);
    fixture.keep(b);
    fixture.keep(c);
    fixture.finish();
}

#[test]
fn test_sgemm_mixed_orientation_rejected_before_device() {
    let mut fixture = SimFixture::open();
    let a = fixture.zeros(64 * 64);
    let b = fixture.zeros(64 * 64);
    let mut c = fixture.zeros(64 * 64);

    fixture.device.clear_events();
    let err = fixture
        .rt
        .sgemm(
            Layout::RowMajor,
            Transpose::NoTrans,
            Transpose::Trans,
            64,
            64,
            64,
            1.0,
            &a,
            64,
            &b,
            64,
            0.0,
            &mut c,
            64,
        )
        .unwrap_err();
    assert!(matches!(err, QpuForgeError::UnsupportedLayout { .. }));
    assert!(err.is_contract_error());
    assert!(fixture.events().is_empty(), "{:?}", fixture.events());

    let err = fixture
        .rt
        .sgemm(
            Layout::ColMajor,
            Transpose::NoTrans,
            Transpose::NoTrans,
            64,
            64,
            64,
            1.0,
            &a,
            64,
            &b,
            64,
            0.0,
            &mut c,
            64,
        )
        .unwrap_err();
    assert!(matches!(err, QpuForgeError::UnsupportedLayout { .. }));

    let err = fixture
        .rt
        .sgemm(
            Layout::RowMajor,
            Transpose::ConjTrans,
            Transpose::ConjTrans,
            64,
            64,
            64,
            1.0,
            &a,
            64,
            &b,
            64,
            0.0,
            &mut c,
            64,
        )
        .unwrap_err();
    assert!(matches!(err, QpuForgeError::InvalidParameter { param: "transa", .. }));
    assert!(fixture.events().is_empty());

    fixture.keep(a);
    fixture.keep(b);
    fixture.keep(c);
    fixture.finish();
}

#[test]
fn test_sgemm_short_output_buffer_rejected() {
    let mut fixture = SimFixture::open();
    let a = fixture.zeros(32 * 8);
    let b = fixture.zeros(8 * 64);
    let mut c = fixture.zeros(32 * 64 - 1);

    let err = fixture
        .rt
        .sgemm(
            Layout::RowMajor,
            Transpose::NoTrans,
            Transpose::NoTrans,
            32,
            64,
            8,
            1.0,
            &a,
            8,
            &b,
            64,
            0.0,
            &mut c,
            64,
        )
        .unwrap_err();
    assert!(matches!(err, QpuForgeError::InvalidParameter { param: "c", .. }));

    fixture.keep(a);
    fixture.keep(b);
    fixture.keep(c);
    fixture.finish();
}

#[test]
fn test_sgemm_overflowing_leading_dimension_rejected() {
    let mut fixture = SimFixture::open();
    let a = fixture.zeros(64);
    let b = fixture.zeros(64);
    let mut c = fixture.zeros(64);

    fixture.device.clear_events();
    let err = fixture
        .rt
        .sgemm(
            Layout::RowMajor,
            Transpose::NoTrans,
            Transpose::NoTrans,
            3,
            2,
            2,
            1.0,
            &a,
            usize::MAX / 2 + 1,
            &b,
            2,
            0.0,
            &mut c,
            2,
        )
        .unwrap_err();
    assert!(matches!(err, QpuForgeError::InvalidParameter { param: "lda", .. }));
    assert!(fixture.events().is_empty());

    fixture.keep(a);
    fixture.keep(b);
    fixture.keep(c);
    fixture.finish();
}
