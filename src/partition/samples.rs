//! Captured nvidia-smi output from A100 nodes.
//!
//! Used by the unit tests, the integration tests and the benches to drive
//! the parsers through [`ScriptedTool`](crate::device::tool::ScriptedTool).

/// `nvidia-smi --query-gpu=index,uuid,memory.total,mig.mode.current --format=csv,noheader`
/// on a two-GPU node, GPU 0 partitioned.
pub const GPU_QUERY_MIXED: &str = "\
0, GPU-5a0c8e12-7a1b-4c44-9f1e-2b9c0d4e6f10, 81920 MiB, Enabled
1, GPU-8d2f1c34-0e6a-4b7d-a3c2-9e8f7a6b5c41, 81920 MiB, Disabled
";

/// `nvidia-smi mig -lgip` on an A100 80GB.
pub const A100_80GB_PROFILES: &str = "\
+-----------------------------------------------------------------------------+
| GPU instance profiles:                                                      |
| GPU   Name             ID    Instances   Memory     P2P    SM    DEC   ENC  |
|                              Free/Total   GiB              CE    JPEG  OFA  |
|=============================================================================|
|   0  MIG 1g.10gb       19     7/7        9.50       No     14     0     0   |
|                                                             1     0     0   |
+-----------------------------------------------------------------------------+
|   0  MIG 2g.20gb       14     3/3        19.50      No     28     1     0   |
|                                                             2     0     0   |
+-----------------------------------------------------------------------------+
|   0  MIG 3g.40gb        9     2/2        39.25      No     42     2     0   |
|                                                             3     0     0   |
+-----------------------------------------------------------------------------+
|   0  MIG 7g.80gb        0     1/1        79.25      No     98     5     0   |
|                                                             7     1     1   |
+-----------------------------------------------------------------------------+
";

/// `nvidia-smi mig -lgip` on an A100 40GB.
pub const A100_40GB_PROFILES: &str = "\
+-----------------------------------------------------------------------------+
| GPU instance profiles:                                                      |
| GPU   Name             ID    Instances   Memory     P2P    SM    DEC   ENC  |
|                              Free/Total   GiB              CE    JPEG  OFA  |
|=============================================================================|
|   0  MIG 1g.5gb        19     7/7        4.75       No     14     0     0   |
|                                                             1     0     0   |
+-----------------------------------------------------------------------------+
|   0  MIG 2g.10gb       14     3/3        9.75       No     28     1     0   |
|                                                             2     0     0   |
+-----------------------------------------------------------------------------+
|   0  MIG 3g.20gb        9     2/2        19.62      No     42     2     0   |
|                                                             3     0     0   |
+-----------------------------------------------------------------------------+
|   0  MIG 4g.20gb        5     1/1        19.62      No     56     2     0   |
|                                                             4     0     0   |
+-----------------------------------------------------------------------------+
|   0  MIG 7g.40gb        0     1/1        39.50      No     98     5     0   |
|                                                             7     1     1   |
+-----------------------------------------------------------------------------+
";

/// `nvidia-smi mig -lgi -i 0` with two 3g.40gb instances.
pub const GPU_INSTANCES: &str = "\
+-------------------------------------------------------+
| GPU instances:                                        |
| GPU   Name             Profile  Instance   Placement  |
|                          ID       ID       Start:Size |
|=======================================================|
|   0  MIG 3g.40gb          9        1          4:4     |
+-------------------------------------------------------+
|   0  MIG 3g.40gb          9        2          0:4     |
+-------------------------------------------------------+
";

/// `nvidia-smi mig -lci -i 0 -gi 1`.
pub const COMPUTE_INSTANCES_GI1: &str = "\
+--------------------------------------------------------------------+
| Compute instances:                                                 |
| GPU     GPU       Name             Profile   Instance   Placement  |
|       Instance                       ID        ID                  |
|         ID                                                         |
|====================================================================|
|   0      1       MIG 3g.40gb          2         0          0:3     |
+--------------------------------------------------------------------+
";

/// `nvidia-smi mig -lci -i 0 -gi 2`.
pub const COMPUTE_INSTANCES_GI2: &str = "\
+--------------------------------------------------------------------+
| Compute instances:                                                 |
| GPU     GPU       Name             Profile   Instance   Placement  |
|       Instance                       ID        ID                  |
|         ID                                                         |
|====================================================================|
|   0      2       MIG 3g.40gb          2         0          0:3     |
+--------------------------------------------------------------------+
";

pub const NO_GPU_INSTANCES: &str = "No GPU instances found: Not Found\n";

pub const NO_COMPUTE_INSTANCES: &str = "No compute instances found: Not Found\n";

pub const MIG_UNSUPPORTED: &str = "No MIG-supported devices found.\n";
